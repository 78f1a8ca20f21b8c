//! HTTP adapters for shelf snapshots and item detection

use crate::domain::types::{epoch_ms, Labels};
use crate::infra::config::Config;
use crate::services::shelf_scanner::{DetectionError, Detector, ShelfImageSource};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, warn};

/// Snapshot cameras reachable over HTTP, one URL per zone
pub struct HttpShelfCamera {
    client: reqwest::Client,
    urls: FxHashMap<String, String>,
    width: u32,
    height: u32,
    quality: u8,
}

impl HttpShelfCamera {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.shelf_timeout())
            .build()
            .context("Failed to build shelf camera client")?;
        let urls = config
            .shelf_zones()
            .iter()
            .map(|z| (z.name.clone(), z.snapshot_url.clone()))
            .collect();
        Ok(Self {
            client,
            urls,
            width: config.shelf_width(),
            height: config.shelf_height(),
            quality: config.shelf_quality(),
        })
    }
}

#[async_trait]
impl ShelfImageSource for HttpShelfCamera {
    async fn fetch(&self, zone_name: &str) -> Option<Bytes> {
        let Some(url) = self.urls.get(zone_name) else {
            warn!(zone = %zone_name, "shelf_camera_unknown_zone");
            return None;
        };

        // `t` defeats intermediate caches so each fetch is a fresh frame
        let resp = self
            .client
            .get(url)
            .query(&[
                ("t", epoch_ms().to_string()),
                ("w", self.width.to_string()),
                ("h", self.height.to_string()),
                ("q", self.quality.to_string()),
            ])
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await;

        let resp = match resp {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(zone = %zone_name, status = %resp.status().as_u16(), "shelf_snapshot_rejected");
                return None;
            }
            Err(e) => {
                warn!(zone = %zone_name, error = %e, "shelf_snapshot_failed");
                return None;
            }
        };

        match resp.bytes().await {
            Ok(body) if !body.is_empty() => {
                debug!(zone = %zone_name, bytes = %body.len(), "shelf_snapshot");
                Some(body)
            }
            Ok(_) => {
                warn!(zone = %zone_name, "shelf_snapshot_empty");
                None
            }
            Err(e) => {
                warn!(zone = %zone_name, error = %e, "shelf_snapshot_read_failed");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    labels: Labels,
}

/// Detection service reached over HTTP (JPEG in, labels out)
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
    confidence: f32,
    iou: f32,
}

impl HttpDetector {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.detector_timeout())
            .build()
            .context("Failed to build detector client")?;
        Ok(Self {
            client,
            url: config.detector_url().to_string(),
            confidence: config.detector_confidence(),
            iou: config.detector_iou(),
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, image: Bytes) -> Result<Labels, DetectionError> {
        let resp = self
            .client
            .post(&self.url)
            .query(&[("conf", self.confidence), ("iou", self.iou)])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(image)
            .send()
            .await
            .map_err(|e| DetectionError::DetectorFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DetectionError::DetectorFailed(format!("status {}", status.as_u16())));
        }

        let body: DetectionResponse =
            resp.json().await.map_err(|e| DetectionError::DetectorFailed(e.to_string()))?;
        Ok(body.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_maps_configured_zones() {
        let camera = HttpShelfCamera::new(&Config::default()).unwrap();
        assert_eq!(camera.urls.get("Table A").map(String::as_str), Some("http://127.0.0.1:8080/snap/camA"));
        assert_eq!(camera.urls.get("Table B").map(String::as_str), Some("http://127.0.0.1:8080/snap/camB"));
        assert_eq!((camera.width, camera.height, camera.quality), (640, 480, 2));
    }

    #[tokio::test]
    async fn test_unknown_zone_has_no_image() {
        let camera = HttpShelfCamera::new(&Config::default()).unwrap();
        assert!(camera.fetch("Freezer").await.is_none());
    }

    #[test]
    fn test_detection_response_shape() {
        let body: DetectionResponse =
            serde_json::from_str(r#"{"labels": ["Pepsi", "Pepsi", "Chips"]}"#).unwrap();
        assert_eq!(body.labels, vec!["Pepsi", "Pepsi", "Chips"]);
        assert!(serde_json::from_str::<DetectionResponse>(r#"{"boxes": []}"#).is_err());
    }
}
