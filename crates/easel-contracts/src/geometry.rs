use serde::{Deserialize, Serialize};

/// Axis-aligned box in canvas pixel coordinates. Immutable value type: every
/// operation that changes a box produces a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Rect {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn from_origin_size(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x.saturating_add(width),
            y2: y.saturating_add(height),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x1 <= other.x1 && self.y1 <= other.y1 && self.x2 >= other.x2 && self.y2 >= other.y2
    }

    /// True once the box reaches every edge of the target rectangle. Used both
    /// as the extension loop's exit test and as the short-circuit check when
    /// the placed source already fills the canvas.
    pub fn covers_target(&self, target_width: u32, target_height: u32) -> bool {
        self.x1 == 0 && self.y1 == 0 && self.x2 >= target_width && self.y2 >= target_height
    }

    /// Grows the box outward by `step` pixels per side, clamped to
    /// `[0, target_width] x [0, target_height]`, until no side can move, the
    /// full target is covered, or one more increment would push the area
    /// gained past `max_area`. The returned box is the last one inside the
    /// budget, so a caller seeing `result == *self` knows expansion stalled.
    pub fn expand_bounded(
        &self,
        target_width: u32,
        target_height: u32,
        max_area: u64,
        step: u32,
    ) -> Rect {
        let area_at_start = self.area();
        let target = Rect::new(0, 0, target_width, target_height);
        let mut expansion = *self;

        loop {
            let next = Rect {
                x1: expansion.x1.saturating_sub(step),
                y1: expansion.y1.saturating_sub(step),
                x2: expansion.x2.saturating_add(step).min(target_width),
                y2: expansion.y2.saturating_add(step).min(target_height),
            };

            // No side moved: the canvas edges are reached.
            if next == expansion {
                break;
            }

            if area_at_start > 0 && next.area() - area_at_start > max_area {
                break;
            }

            expansion = next;

            if expansion == target {
                break;
            }
        }

        expansion
    }
}
