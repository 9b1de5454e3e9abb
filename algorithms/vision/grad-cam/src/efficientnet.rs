//! `tf_efficientnet_b0` as laid out by timm, evaluated with candle.
//!
//! Every tensor is looked up under the name timm gives it in a state dict
//! (`conv_stem.weight`, `blocks.{stage}.{block}.conv_dw.weight`,
//! `conv_head.weight`, `classifier.weight`, ...), so a checkpoint exported from
//! the training code loads without renaming. Convolutions use TensorFlow "SAME"
//! padding and batch norms run in inference mode with `eps = 1e-3`.

use candle_core::{D, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder};
use ndarray::{Array1, Array3, ArrayView4};
use retigrade_helpers::{ModelConfig, NUM_STAGES};

use crate::ModelError;
use crate::tape::CaptureTape;

pub const STEM_CHANNELS: usize = 32;
pub const HEAD_CHANNELS: usize = 1280;
const SE_RATIO: f64 = 0.25;
const BN_TENSORS: [&str; 4] = ["weight", "bias", "running_mean", "running_var"];

#[derive(Debug, Clone, Copy)]
struct StageSpec {
    repeats: usize,
    kernel: usize,
    stride: usize,
    expand: usize,
    out_channels: usize,
}

const fn stage(repeats: usize, kernel: usize, stride: usize, expand: usize, out_channels: usize) -> StageSpec {
    StageSpec {
        repeats,
        kernel,
        stride,
        expand,
        out_channels,
    }
}

/// B0 stages: depth and width multipliers are both 1.0.
const STAGES: [StageSpec; 7] = [
    stage(1, 3, 1, 1, 16),
    stage(2, 3, 2, 6, 24),
    stage(2, 5, 2, 6, 40),
    stage(3, 3, 2, 6, 80),
    stage(3, 5, 1, 6, 112),
    stage(4, 5, 2, 6, 192),
    stage(1, 3, 1, 6, 320),
];

/// One block of the backbone with its resolved channel counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockPlan {
    stage: usize,
    index: usize,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    expand: usize,
}

impl BlockPlan {
    fn prefix(&self) -> String {
        format!("blocks.{}.{}", self.stage, self.index)
    }

    fn is_depthwise_separable(&self) -> bool {
        self.expand == 1
    }

    fn mid_channels(&self) -> usize {
        self.in_channels * self.expand
    }

    /// Squeeze width is relative to the block input, not the expanded width.
    fn se_channels(&self) -> usize {
        ((self.in_channels as f64 * SE_RATIO).round() as usize).max(1)
    }

    fn has_skip(&self) -> bool {
        self.stride == 1 && self.in_channels == self.out_channels
    }
}

fn block_plan() -> Vec<BlockPlan> {
    let mut plan = Vec::new();
    let mut in_channels = STEM_CHANNELS;
    for (stage, spec) in STAGES.iter().enumerate() {
        for index in 0..spec.repeats {
            plan.push(BlockPlan {
                stage,
                index,
                in_channels,
                out_channels: spec.out_channels,
                kernel: spec.kernel,
                stride: if index == 0 { spec.stride } else { 1 },
                expand: spec.expand,
            });
            in_channels = spec.out_channels;
        }
    }
    plan
}

/// Every tensor the network reads, with its shape, in state-dict order.
pub fn parameter_shapes() -> Vec<(String, Vec<usize>)> {
    fn conv(shapes: &mut Vec<(String, Vec<usize>)>, name: String, out: usize, per_group: usize, kernel: usize) {
        shapes.push((name, vec![out, per_group, kernel, kernel]));
    }
    fn bn(shapes: &mut Vec<(String, Vec<usize>)>, prefix: &str, channels: usize) {
        for tensor in BN_TENSORS {
            shapes.push((format!("{prefix}.{tensor}"), vec![channels]));
        }
    }
    fn se(shapes: &mut Vec<(String, Vec<usize>)>, prefix: &str, channels: usize, reduced: usize) {
        conv(shapes, format!("{prefix}.se.conv_reduce.weight"), reduced, channels, 1);
        shapes.push((format!("{prefix}.se.conv_reduce.bias"), vec![reduced]));
        conv(shapes, format!("{prefix}.se.conv_expand.weight"), channels, reduced, 1);
        shapes.push((format!("{prefix}.se.conv_expand.bias"), vec![channels]));
    }

    let mut shapes = Vec::new();
    conv(&mut shapes, "conv_stem.weight".into(), STEM_CHANNELS, 3, 3);
    bn(&mut shapes, "bn1", STEM_CHANNELS);
    let mut channels = STEM_CHANNELS;
    for block in block_plan() {
        let p = block.prefix();
        if block.is_depthwise_separable() {
            conv(&mut shapes, format!("{p}.conv_dw.weight"), block.in_channels, 1, block.kernel);
            bn(&mut shapes, &format!("{p}.bn1"), block.in_channels);
            se(&mut shapes, &p, block.in_channels, block.se_channels());
            conv(&mut shapes, format!("{p}.conv_pw.weight"), block.out_channels, block.in_channels, 1);
            bn(&mut shapes, &format!("{p}.bn2"), block.out_channels);
        } else {
            let mid = block.mid_channels();
            conv(&mut shapes, format!("{p}.conv_pw.weight"), mid, block.in_channels, 1);
            bn(&mut shapes, &format!("{p}.bn1"), mid);
            conv(&mut shapes, format!("{p}.conv_dw.weight"), mid, 1, block.kernel);
            bn(&mut shapes, &format!("{p}.bn2"), mid);
            se(&mut shapes, &p, mid, block.se_channels());
            conv(&mut shapes, format!("{p}.conv_pwl.weight"), block.out_channels, mid, 1);
            bn(&mut shapes, &format!("{p}.bn3"), block.out_channels);
        }
        channels = block.out_channels;
    }
    conv(&mut shapes, "conv_head.weight".into(), HEAD_CHANNELS, channels, 1);
    bn(&mut shapes, "bn2", HEAD_CHANNELS);
    shapes.push(("classifier.weight".into(), vec![NUM_STAGES, HEAD_CHANNELS]));
    shapes.push(("classifier.bias".into(), vec![NUM_STAGES]));
    shapes
}

/// Split of the TensorFlow "SAME" padding for one spatial axis. The odd
/// pixel goes to the trailing side.
pub(crate) fn same_padding(size: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let out = size.div_ceil(stride);
    let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(size);
    (total / 2, total - total / 2)
}

#[derive(Debug, Clone)]
struct SameConv {
    conv: Conv2d,
    kernel: usize,
    stride: usize,
}

impl SameConv {
    fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
    ) -> candle_core::Result<Self> {
        let config = Conv2dConfig {
            stride,
            groups,
            ..Default::default()
        };
        let conv = candle_nn::conv2d_no_bias(in_channels, out_channels, kernel, config, vb)?;
        Ok(Self { conv, kernel, stride })
    }
}

impl Module for SameConv {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (_, _, height, width) = x.dims4()?;
        let (top, bottom) = same_padding(height, self.kernel, self.stride);
        let (left, right) = same_padding(width, self.kernel, self.stride);
        if top + bottom + left + right == 0 {
            return self.conv.forward(x);
        }
        let padded = x.pad_with_zeros(2, top, bottom)?.pad_with_zeros(3, left, right)?;
        self.conv.forward(&padded)
    }
}

/// Inference-mode batch norm folded into one scale and shift per channel,
/// optionally followed by SiLU.
#[derive(Debug, Clone)]
struct FrozenBatchNorm {
    scale: Tensor,
    shift: Tensor,
    activate: bool,
}

impl FrozenBatchNorm {
    fn load(vb: VarBuilder, channels: usize, eps: f64, activate: bool) -> candle_core::Result<Self> {
        let weight = vb.get(channels, "weight")?;
        let bias = vb.get(channels, "bias")?;
        let mean = vb.get(channels, "running_mean")?;
        let var = vb.get(channels, "running_var")?;
        let scale = weight.div(&var.affine(1.0, eps)?.sqrt()?)?;
        let shift = bias.sub(&mean.mul(&scale)?)?;
        Ok(Self {
            scale: scale.reshape((1, channels, 1, 1))?,
            shift: shift.reshape((1, channels, 1, 1))?,
            activate,
        })
    }
}

impl Module for FrozenBatchNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let y = x.broadcast_mul(&self.scale)?.broadcast_add(&self.shift)?;
        if self.activate { y.silu() } else { Ok(y) }
    }
}

#[derive(Debug, Clone)]
struct SqueezeExcite {
    reduce: Conv2d,
    expand: Conv2d,
}

impl SqueezeExcite {
    fn load(vb: VarBuilder, channels: usize, reduced: usize) -> candle_core::Result<Self> {
        let reduce = candle_nn::conv2d(channels, reduced, 1, Default::default(), vb.pp("conv_reduce"))?;
        let expand = candle_nn::conv2d(reduced, channels, 1, Default::default(), vb.pp("conv_expand"))?;
        Ok(Self { reduce, expand })
    }
}

impl Module for SqueezeExcite {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let pooled = x.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
        let gate = self.expand.forward(&self.reduce.forward(&pooled)?.silu()?)?;
        x.broadcast_mul(&candle_nn::ops::sigmoid(&gate)?)
    }
}

/// Mobile inverted bottleneck. Blocks without expansion (stage 0) have no
/// leading pointwise convolution and timm names their layers differently.
#[derive(Debug, Clone)]
struct MbConv {
    expand: Option<(SameConv, FrozenBatchNorm)>,
    conv_dw: SameConv,
    bn_dw: FrozenBatchNorm,
    se: SqueezeExcite,
    project: SameConv,
    bn_project: FrozenBatchNorm,
    skip: bool,
}

impl MbConv {
    fn load(vb: VarBuilder, plan: &BlockPlan, eps: f64) -> candle_core::Result<Self> {
        let mid = plan.mid_channels();
        let dw = |vb: VarBuilder| SameConv::load(vb, mid, mid, plan.kernel, plan.stride, mid);
        let se = SqueezeExcite::load(vb.pp("se"), mid, plan.se_channels())?;
        if plan.is_depthwise_separable() {
            Ok(Self {
                expand: None,
                conv_dw: dw(vb.pp("conv_dw"))?,
                bn_dw: FrozenBatchNorm::load(vb.pp("bn1"), mid, eps, true)?,
                se,
                project: SameConv::load(vb.pp("conv_pw"), mid, plan.out_channels, 1, 1, 1)?,
                bn_project: FrozenBatchNorm::load(vb.pp("bn2"), plan.out_channels, eps, false)?,
                skip: plan.has_skip(),
            })
        } else {
            let expand = (
                SameConv::load(vb.pp("conv_pw"), plan.in_channels, mid, 1, 1, 1)?,
                FrozenBatchNorm::load(vb.pp("bn1"), mid, eps, true)?,
            );
            Ok(Self {
                expand: Some(expand),
                conv_dw: dw(vb.pp("conv_dw"))?,
                bn_dw: FrozenBatchNorm::load(vb.pp("bn2"), mid, eps, true)?,
                se,
                project: SameConv::load(vb.pp("conv_pwl"), mid, plan.out_channels, 1, 1, 1)?,
                bn_project: FrozenBatchNorm::load(vb.pp("bn3"), plan.out_channels, eps, false)?,
                skip: plan.has_skip(),
            })
        }
    }
}

impl Module for MbConv {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut y = x.clone();
        if let Some((conv, bn)) = &self.expand {
            y = bn.forward(&conv.forward(&y)?)?;
        }
        y = self.bn_dw.forward(&self.conv_dw.forward(&y)?)?;
        y = self.se.forward(&y)?;
        y = self.bn_project.forward(&self.project.forward(&y)?)?;
        if self.skip { y + x } else { Ok(y) }
    }
}

/// EfficientNet-B0 with a five-way classifier.
#[derive(Debug, Clone)]
pub struct EfficientNet {
    config: ModelConfig,
    device: Device,
    conv_stem: SameConv,
    bn1: FrozenBatchNorm,
    blocks: Vec<MbConv>,
    conv_head: SameConv,
    bn2: FrozenBatchNorm,
    classifier: Linear,
}

impl EfficientNet {
    /// Builds the network from `vb`. Every tensor is fetched here, so a
    /// missing name or a shape that disagrees with the architecture fails
    /// before any request is served.
    pub fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self, ModelError> {
        let device = vb.device().clone();
        let eps = config.bn_eps;
        let conv_stem = SameConv::load(vb.pp("conv_stem"), 3, STEM_CHANNELS, 3, 2, 1).map_err(ModelError::load)?;
        let bn1 = FrozenBatchNorm::load(vb.pp("bn1"), STEM_CHANNELS, eps, true).map_err(ModelError::load)?;
        let plan = block_plan();
        let mut blocks = Vec::with_capacity(plan.len());
        for block in &plan {
            blocks.push(MbConv::load(vb.pp(block.prefix()), block, eps).map_err(ModelError::load)?);
        }
        let last = plan.last().map_or(STEM_CHANNELS, |b| b.out_channels);
        let conv_head = SameConv::load(vb.pp("conv_head"), last, HEAD_CHANNELS, 1, 1, 1).map_err(ModelError::load)?;
        let bn2 = FrozenBatchNorm::load(vb.pp("bn2"), HEAD_CHANNELS, eps, true).map_err(ModelError::load)?;
        let classifier =
            candle_nn::linear(HEAD_CHANNELS, NUM_STAGES, vb.pp("classifier")).map_err(ModelError::load)?;
        Ok(Self {
            config: config.clone(),
            device,
            conv_stem,
            bn1,
            blocks,
            conv_head,
            bn2,
            classifier,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Stage logits for a `(1, 3, S, S)` input.
    pub fn forward(&self, input: ArrayView4<f32>) -> Result<Array1<f32>, ModelError> {
        let x = self.input_tensor(input)?;
        let logits = self
            .features(&x)
            .and_then(|features| self.head(&features))
            .map_err(ModelError::inference)?;
        Ok(Array1::from(logits.flatten_all().and_then(|t| t.to_vec1::<f32>()).map_err(ModelError::inference)?))
    }

    /// Forward pass that keeps the `conv_head` output as a gradient leaf.
    ///
    /// The backbone runs without recording, the head runs on top of the leaf
    /// and the returned tape backpropagates a class score onto it.
    pub fn forward_captured(&self, input: ArrayView4<f32>) -> Result<(Array1<f32>, CaptureTape), ModelError> {
        let x = self.input_tensor(input)?;
        let features = self.features(&x).map_err(ModelError::inference)?;
        let leaf = Var::from_tensor(&features).map_err(ModelError::inference)?;
        let logits = self.head(leaf.as_tensor()).map_err(ModelError::inference)?;
        let values = logits.flatten_all().and_then(|t| t.to_vec1::<f32>()).map_err(ModelError::inference)?;
        Ok((Array1::from(values), CaptureTape::record(leaf, logits)?))
    }

    /// Backbone up to and including the `conv_head` convolution.
    pub(crate) fn features(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = self.bn1.forward(&self.conv_stem.forward(x)?)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.conv_head.forward(&x)
    }

    /// `bn2`, global average pooling and the classifier, from the
    /// `conv_head` output to `(1, 5)` logits.
    pub(crate) fn head(&self, features: &Tensor) -> candle_core::Result<Tensor> {
        let x = self.bn2.forward(features)?;
        let pooled = x.mean(D::Minus1)?.mean(D::Minus1)?;
        self.classifier.forward(&pooled)
    }

    fn input_tensor(&self, input: ArrayView4<f32>) -> Result<Tensor, ModelError> {
        let size = self.config.input_size;
        let expected = (1, 3, size, size);
        if input.dim() != expected {
            return Err(ModelError::InputShape {
                expected,
                found: input.dim(),
            });
        }
        let data: Vec<f32> = input.iter().copied().collect();
        Tensor::from_vec(data, (1, 3, size, size), &self.device).map_err(ModelError::inference)
    }
}

/// Copies a `(1, C, h, w)` tensor into a `(C, h, w)` array.
pub(crate) fn to_array3(tensor: &Tensor) -> Result<Array3<f32>, ModelError> {
    let (_, channels, height, width) = tensor.dims4().map_err(ModelError::inference)?;
    let data = tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(ModelError::inference)?;
    Array3::from_shape_vec((channels, height, width), data).map_err(ModelError::inference)
}
