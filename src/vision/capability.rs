use crate::core::types::{ImageLabel, OcrBlock};
use anyhow::Result;
use async_trait::async_trait;

/// Read access to wherever the uploaded images live. The surrounding system
/// owns the bucket/presigning; we only ever fetch bytes by reference.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get_image_bytes(&self, image_ref: &str) -> Result<Vec<u8>>;
}

/// External vision OCR/label capability. Block coordinates are normalized
/// to [0,1] relative to the analyzed image.
#[async_trait]
pub trait VisionCapability: Send + Sync + 'static {
    async fn detect_text(&self, image: &[u8]) -> Result<Vec<OcrBlock>>;
    async fn detect_labels(&self, image: &[u8]) -> Result<Vec<ImageLabel>>;
}

/// Filesystem-backed store for the CLI path: the image reference is a path.
pub struct LocalObjectStore;

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get_image_bytes(&self, image_ref: &str) -> Result<Vec<u8>> {
        use crate::core::error::PipelineError;
        tokio::fs::read(image_ref).await.map_err(|e| {
            PipelineError::InvalidInput(format!("cannot read image {image_ref}: {e}")).into()
        })
    }
}
