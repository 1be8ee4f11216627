use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::Rect;

/// Persisted-asset descriptor returned to callers once the extended image has
/// been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: Uuid,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

impl AssetRecord {
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_url: image_url.into(),
            created_at: Utc::now(),
        }
    }
}

/// Metadata attached to the final storage upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub artwork_type: String,
    pub user_id: String,
    pub artwork_status: String,
    pub artwork_width: String,
    pub artwork_height: String,
}

/// How the extension loop ended. Partial outcomes are still successes (the
/// canvas has at least the placed source on it), but callers can now tell
/// them apart from a fully covered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The canvas reached the target dimensions.
    Complete,
    /// The placed source already covered the target; no inpainting ran.
    AlreadyCovered,
    /// Expansion stalled or an iteration failed before full coverage.
    Stalled,
    /// The iteration cap was hit before full coverage.
    IterationCapped,
}

impl CompletionStatus {
    pub fn is_full_coverage(self) -> bool {
        matches!(self, Self::Complete | Self::AlreadyCovered)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionOutcome {
    pub asset: AssetRecord,
    pub status: CompletionStatus,
    pub iterations: u32,
    /// The canvas region actually covered with content when the loop ended.
    pub coverage: Rect,
}
