pub mod assets;
pub mod geometry;
pub mod ocr;
pub mod requests;

pub use assets::{AssetRecord, CompletionStatus, ExtensionOutcome, UploadMetadata};
pub use geometry::Rect;
pub use ocr::{OcrResult, TextRegion};
pub use requests::{BoxSpec, ExtendImageRequest, ExtensionPolicy};
