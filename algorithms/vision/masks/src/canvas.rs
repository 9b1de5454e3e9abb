use ndarray::{Array2, ArrayView2, Zip};
use retigrade_helpers::MaskConfig;

use crate::MaskError;
use crate::resize::resize_nearest;

/// Whether stamps set or clear pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrushMode {
    #[default]
    Paint,
    Erase,
}

/// A single stamp applied to the canvas, in canvas pixel coordinates.
///
/// Coordinates may lie outside the canvas; the stamp is clipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrokeEvent {
    /// Filled disc of the brush radius centred on the point.
    Dot { x: i32, y: i32 },
    /// Segment with rounded ends, `2 * radius` thick.
    Segment { from: (i32, i32), to: (i32, i32) },
}

/// Binary mask painted free-hand by the user.
#[derive(Debug, Clone)]
pub struct UserCanvas {
    mask: Array2<bool>,
    radius: u32,
    min_radius: u32,
    mode: BrushMode,
    last: Option<(i32, i32)>,
}

impl UserCanvas {
    /// All-clear canvas using the default brush settings.
    pub fn new(width: usize, height: usize) -> Result<Self, MaskError> {
        Self::with_config(width, height, &MaskConfig::default())
    }

    pub fn with_config(width: usize, height: usize, config: &MaskConfig) -> Result<Self, MaskError> {
        if width == 0 || height == 0 {
            return Err(MaskError::ZeroSize { width, height });
        }
        let min_radius = config.min_brush_radius.max(1);
        Ok(Self {
            mask: Array2::from_elem((height, width), false),
            radius: config.brush_radius.max(min_radius),
            min_radius,
            mode: BrushMode::Paint,
            last: None,
        })
    }

    pub fn width(&self) -> usize {
        self.mask.ncols()
    }

    pub fn height(&self) -> usize {
        self.mask.nrows()
    }

    pub fn brush_radius(&self) -> u32 {
        self.radius
    }

    /// Sets the brush radius, raising it to the configured minimum if needed.
    /// Returns the radius actually in effect.
    pub fn set_brush_radius(&mut self, radius: u32) -> u32 {
        self.radius = radius.max(self.min_radius);
        self.radius
    }

    pub fn mode(&self) -> BrushMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: BrushMode) {
        self.mode = mode;
    }

    pub fn apply(&mut self, event: StrokeEvent) {
        let value = self.mode == BrushMode::Paint;
        let r = self.radius as i64;
        match event {
            StrokeEvent::Dot { x, y } => {
                let (cx, cy) = (x as i64, y as i64);
                self.stamp(cx - r, cy - r, cx + r, cy + r, value, |px, py| {
                    let (dx, dy) = (px - cx, py - cy);
                    dx * dx + dy * dy <= r * r
                });
            }
            StrokeEvent::Segment { from, to } => {
                let (ax, ay) = (from.0 as f64, from.1 as f64);
                let (bx, by) = (to.0 as f64, to.1 as f64);
                let reach = (r * r) as f64;
                self.stamp(
                    from.0.min(to.0) as i64 - r,
                    from.1.min(to.1) as i64 - r,
                    from.0.max(to.0) as i64 + r,
                    from.1.max(to.1) as i64 + r,
                    value,
                    |px, py| segment_distance_sq(px as f64, py as f64, ax, ay, bx, by) <= reach,
                );
            }
        }
    }

    /// Starts a drag at `(x, y)` by stamping a dot.
    pub fn begin_stroke(&mut self, x: i32, y: i32) {
        self.apply(StrokeEvent::Dot { x, y });
        self.last = Some((x, y));
    }

    /// Continues the current drag to `(x, y)`. Returns `false`, painting
    /// nothing, when no drag is in progress.
    pub fn extend_stroke(&mut self, x: i32, y: i32) -> bool {
        let Some(from) = self.last else {
            return false;
        };
        self.apply(StrokeEvent::Segment { from, to: (x, y) });
        self.last = Some((x, y));
        true
    }

    pub fn end_stroke(&mut self) {
        self.last = None;
    }

    /// Applies a whole mask at once in the current mode. The mask is scaled
    /// to the canvas with nearest-neighbour sampling.
    pub fn overlay(&mut self, mask: ArrayView2<bool>) -> Result<(), MaskError> {
        let scaled = resize_nearest(mask, self.height(), self.width())?;
        let value = self.mode == BrushMode::Paint;
        Zip::from(&mut self.mask).and(&scaled).for_each(|pixel, &hit| {
            if hit {
                *pixel = value;
            }
        });
        Ok(())
    }

    /// Maps a position given as fractions of the displayed image onto canvas
    /// pixels, or `None` when it falls outside the image.
    pub fn locate(&self, nx: f64, ny: f64) -> Option<(i32, i32)> {
        if !(0.0..1.0).contains(&nx) || !(0.0..1.0).contains(&ny) {
            return None;
        }
        let x = ((nx * self.width() as f64) as usize).min(self.width() - 1);
        let y = ((ny * self.height() as f64) as usize).min(self.height() - 1);
        Some((x as i32, y as i32))
    }

    pub fn clear(&mut self) {
        self.mask.fill(false);
        self.last = None;
    }

    pub fn is_empty(&self) -> bool {
        !self.mask.iter().any(|&m| m)
    }

    pub fn painted_pixels(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    pub fn mask(&self) -> ArrayView2<'_, bool> {
        self.mask.view()
    }

    pub fn into_mask(self) -> Array2<bool> {
        self.mask
    }

    fn stamp<P>(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, value: bool, inside: P)
    where
        P: Fn(i64, i64) -> bool,
    {
        let max_x = self.width() as i64 - 1;
        let max_y = self.height() as i64 - 1;
        if x1 < 0 || y1 < 0 || x0 > max_x || y0 > max_y {
            return;
        }
        for py in y0.max(0)..=y1.min(max_y) {
            for px in x0.max(0)..=x1.min(max_x) {
                if inside(px, py) {
                    self.mask[[py as usize, px as usize]] = value;
                }
            }
        }
    }
}

fn segment_distance_sq(px: f64, py: f64, ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let (dx, dy) = (bx - ax, by - ay);
    let length_sq = dx * dx + dy * dy;
    let t = if length_sq == 0.0 {
        0.0
    } else {
        (((px - ax) * dx + (py - ay) * dy) / length_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    (px - cx).powi(2) + (py - cy).powi(2)
}
