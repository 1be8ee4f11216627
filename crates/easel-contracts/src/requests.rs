use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::Rect;

/// Placement of the source image inside the target canvas, as submitted by
/// the caller: origin plus size, matching the HTTP parameter blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxSpec {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoxSpec {
    pub fn to_rect(self) -> Rect {
        Rect::from_origin_size(self.x, self.y, self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendImageRequest {
    pub target_width: u32,
    pub target_height: u32,
    pub original_box: BoxSpec,
    /// Mask orientation for the generation backend; inverted by default,
    /// matching how the downstream inpainting model reads masks.
    #[serde(default = "default_invert_text")]
    pub invert_text: bool,
    #[serde(default)]
    pub remove_text: bool,
}

fn default_invert_text() -> bool {
    true
}

impl ExtendImageRequest {
    pub fn validate(&self) -> Result<()> {
        if self.target_width == 0 || self.target_height == 0 {
            bail!("target dimensions must be non-zero");
        }
        if self.original_box.width == 0 || self.original_box.height == 0 {
            bail!("original box must have non-zero size");
        }
        let rect = self.original_box.to_rect();
        if rect.x2 > self.target_width || rect.y2 > self.target_height {
            bail!(
                "original box {:?} exceeds target {}x{}",
                rect,
                self.target_width,
                self.target_height
            );
        }
        Ok(())
    }
}

/// Tuning knobs for the extension loop. The defaults reproduce the production
/// behavior; they are parameters rather than constants so the overlap and
/// area-budget values can be adjusted without code changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionPolicy {
    /// Pixels each side grows per increment of the greedy expansion.
    pub expansion_step: u32,
    /// Per-iteration area budget as a fraction of the placed source's area.
    pub area_budget_ratio: f64,
    /// Lower bound on the context overlap re-exposed to the model, in pixels.
    pub overlap_min_px: u32,
    /// Context overlap as a fraction of the previous box's dimension.
    pub overlap_ratio: f64,
    /// Hard cap on extension iterations.
    pub max_iterations: u32,
}

impl Default for ExtensionPolicy {
    fn default() -> Self {
        Self {
            expansion_step: 10,
            area_budget_ratio: 0.6,
            overlap_min_px: 5,
            overlap_ratio: 0.05,
            max_iterations: 20,
        }
    }
}

impl ExtensionPolicy {
    pub fn max_extension_area(&self, source_area: u64) -> u64 {
        (source_area as f64 * self.area_budget_ratio) as u64
    }

    /// Overlap margin applied to a side that grew: `max(min_px, ratio * dim)`.
    pub fn overlap_for(&self, dimension: u32) -> u32 {
        self.overlap_min_px
            .max((f64::from(dimension) * self.overlap_ratio) as u32)
    }
}
