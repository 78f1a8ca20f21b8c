//! Shelf scanning: fetch a snapshot of a zone's shelf and detect the items on it
//!
//! Both collaborators sit behind async traits so the tracker can be driven
//! by in-memory fakes in tests and by the HTTP adapters in `io::shelf` in
//! production.

use crate::domain::types::Labels;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    /// No snapshot could be fetched; never the same as "shelf is empty"
    #[error("no shelf image for zone '{zone}'")]
    ImageUnavailable { zone: String },
    #[error("detector failed: {0}")]
    DetectorFailed(String),
}

/// Source of shelf snapshots, one per zone
#[async_trait]
pub trait ShelfImageSource: Send + Sync {
    /// `None` means the image could not be obtained
    async fn fetch(&self, zone_name: &str) -> Option<Bytes>;
}

/// Item detector; output is a multiset of labels in detector order
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: Bytes) -> Result<Labels, DetectionError>;
}

/// Snapshot + detection for one zone
pub struct ShelfScanner {
    source: Arc<dyn ShelfImageSource>,
    detector: Arc<dyn Detector>,
}

impl ShelfScanner {
    pub fn new(source: Arc<dyn ShelfImageSource>, detector: Arc<dyn Detector>) -> Self {
        Self { source, detector }
    }

    pub async fn scan(&self, zone_name: &str) -> Result<Labels, DetectionError> {
        let image = self
            .source
            .fetch(zone_name)
            .await
            .ok_or_else(|| DetectionError::ImageUnavailable { zone: zone_name.to_string() })?;
        let labels = self.detector.detect(image).await?;
        // blank labels are detector noise
        Ok(labels.into_iter().filter(|l| !l.trim().is_empty()).collect())
    }
}
