use async_trait::async_trait;
use bytes::Bytes;
use common::error::AppError;

use crate::utils::image_codec::compress_image;

/// The codec seam of the pipeline.
#[async_trait]
pub trait CompressionEngine: Send + Sync {
    /// Returns the re-encoded image, in the same format as the input.
    async fn compress(&self, input: Bytes, mime_type: &str, quality: u8)
        -> Result<Vec<u8>, AppError>;
}

/// Engine backed by the `image` crate. Encoding runs on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageEngine;

#[async_trait]
impl CompressionEngine for ImageEngine {
    async fn compress(
        &self,
        input: Bytes,
        mime_type: &str,
        quality: u8,
    ) -> Result<Vec<u8>, AppError> {
        let mime_type = mime_type.to_string();
        tokio::task::spawn_blocking(move || compress_image(&input, &mime_type, quality)).await?
    }
}
