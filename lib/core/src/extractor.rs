use crate::{FeatureRow, FeatureTable, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One extraction job: a single (channel set, z, t) plane of an image at a scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub image_id: u64,
    pub featureset: String,
    pub pixels_id: u64,
    pub channels: Vec<u64>,
    pub z: u64,
    pub t: u64,
    pub scale: f64,
}

/// Pixel-level feature computation and the per-image authoritative feature records.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    /// Compute and attach one feature row to the image's authoritative record.
    async fn extract(&self, request: &ExtractionRequest) -> Result<FeatureRow>;

    /// Whether the image already carries features for `featureset`.
    async fn has(&self, image_id: u64, featureset: &str) -> Result<bool>;

    /// The image's authoritative feature table, rows oldest first.
    ///
    /// Fails with `Error::NotFound` when the image has no table for `featureset`.
    async fn get_authoritative(&self, image_id: u64, featureset: &str) -> Result<FeatureTable>;
}
