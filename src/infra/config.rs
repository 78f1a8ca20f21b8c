//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::Rect;
use anyhow::{ensure, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// What to do when a track re-enters a zone whose exit diff is still pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReentryMode {
    /// Cancel the pending diff and keep its baseline for the new visit
    #[default]
    CarryOver,
    /// Let the pending diff run and capture a fresh baseline
    Independent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_frames_topic")]
    pub frames_topic: String,
    #[serde(default = "default_control_topic")]
    pub control_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_frames_topic() -> String {
    "store/frames".to_string()
}

fn default_control_topic() -> String {
    "store/control".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_enabled() -> bool {
    true
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: default_broker_enabled(),
            bind_address: default_broker_bind_address(),
            port: default_broker_port(),
        }
    }
}

/// A shelf zone: where shoppers stand and which camera watches the shelf
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShelfZone {
    pub name: String,
    pub rect: Rect,
    pub snapshot_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZonesConfig {
    /// Inclusion margin in pixels around every zone rectangle
    #[serde(default = "default_zone_margin")]
    pub margin: f64,
    #[serde(default)]
    pub shelf: Vec<ShelfZone>,
}

fn default_zone_margin() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IdentityConfig {
    /// Tracks standing here receive every code read (auto-link)
    #[serde(default)]
    pub link_zone: Option<Rect>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Consecutive frames a track may be missing before it counts as departed
    #[serde(default = "default_departure_after_frames")]
    pub departure_after_frames: u32,
}

fn default_departure_after_frames() -> u32 {
    1
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self { departure_after_frames: default_departure_after_frames() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiffConfig {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub reentry: ReentryMode,
}

fn default_settle_delay_ms() -> u64 {
    2000
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self { settle_delay_ms: default_settle_delay_ms(), reentry: ReentryMode::default() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShelfConfig {
    #[serde(default = "default_shelf_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_shelf_width")]
    pub width: u32,
    #[serde(default = "default_shelf_height")]
    pub height: u32,
    /// JPEG quality knob passed through to the snapshot service
    #[serde(default = "default_shelf_quality")]
    pub quality: u8,
}

fn default_shelf_timeout_ms() -> u64 {
    6000
}

fn default_shelf_width() -> u32 {
    640
}

fn default_shelf_height() -> u32 {
    480
}

fn default_shelf_quality() -> u8 {
    2
}

impl Default for ShelfConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_shelf_timeout_ms(),
            width: default_shelf_width(),
            height: default_shelf_height(),
            quality: default_shelf_quality(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_url")]
    pub url: String,
    #[serde(default = "default_detector_confidence")]
    pub confidence: f32,
    #[serde(default = "default_detector_iou")]
    pub iou: f32,
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_detector_url() -> String {
    "http://127.0.0.1:9000/detect".to_string()
}

fn default_detector_confidence() -> f32 {
    0.30
}

fn default_detector_iou() -> f32 {
    0.45
}

fn default_detector_timeout_ms() -> u64 {
    10_000
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            url: default_detector_url(),
            confidence: default_detector_confidence(),
            iou: default_detector_iou(),
            timeout_ms: default_detector_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_invoice_timeout_ms")]
    pub invoice_timeout_ms: u64,
    /// Session/event egress buffer
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_invoice_queue_size")]
    pub invoice_queue_size: usize,
}

fn default_backend_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_publish_timeout_ms() -> u64 {
    500
}

fn default_invoice_timeout_ms() -> u64 {
    5000
}

fn default_queue_size() -> usize {
    1000
}

fn default_invoice_queue_size() -> usize {
    32
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_base_url(),
            publish_timeout_ms: default_publish_timeout_ms(),
            invoice_timeout_ms: default_invoice_timeout_ms(),
            queue_size: default_queue_size(),
            invoice_queue_size: default_invoice_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "store".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    pub zones: ZonesConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub shelf: ShelfConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_frames_topic: String,
    mqtt_control_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    zone_margin: f64,
    shelf_zones: Vec<ShelfZone>,
    link_zone: Option<Rect>,
    departure_after_frames: u32,
    settle_delay_ms: u64,
    reentry_mode: ReentryMode,
    shelf_timeout_ms: u64,
    shelf_width: u32,
    shelf_height: u32,
    shelf_quality: u8,
    detector_url: String,
    detector_confidence: f32,
    detector_iou: f32,
    detector_timeout_ms: u64,
    backend_base_url: String,
    publish_timeout_ms: u64,
    invoice_timeout_ms: u64,
    egress_queue_size: usize,
    invoice_queue_size: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_frames_topic: default_frames_topic(),
            mqtt_control_topic: default_control_topic(),
            mqtt_username: None,
            mqtt_password: None,
            broker_enabled: default_broker_enabled(),
            broker_bind_address: default_broker_bind_address(),
            broker_port: default_broker_port(),
            zone_margin: default_zone_margin(),
            shelf_zones: Self::default_shelf_zones(),
            link_zone: Some(Rect::new(280.0, 60.0, 330.0, 180.0)),
            departure_after_frames: default_departure_after_frames(),
            settle_delay_ms: default_settle_delay_ms(),
            reentry_mode: ReentryMode::default(),
            shelf_timeout_ms: default_shelf_timeout_ms(),
            shelf_width: default_shelf_width(),
            shelf_height: default_shelf_height(),
            shelf_quality: default_shelf_quality(),
            detector_url: default_detector_url(),
            detector_confidence: default_detector_confidence(),
            detector_iou: default_detector_iou(),
            detector_timeout_ms: default_detector_timeout_ms(),
            backend_base_url: default_backend_base_url(),
            publish_timeout_ms: default_publish_timeout_ms(),
            invoice_timeout_ms: default_invoice_timeout_ms(),
            egress_queue_size: default_queue_size(),
            invoice_queue_size: default_invoice_queue_size(),
            metrics_interval_secs: 10,
            prometheus_port: default_prometheus_port(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    fn default_shelf_zones() -> Vec<ShelfZone> {
        vec![
            ShelfZone {
                name: "Table A".to_string(),
                rect: Rect::new(460.0, 215.0, 520.0, 366.0),
                snapshot_url: "http://127.0.0.1:8080/snap/camA".to_string(),
            },
            ShelfZone {
                name: "Table B".to_string(),
                rect: Rect::new(127.0, 134.0, 190.0, 250.0),
                snapshot_url: "http://127.0.0.1:8080/snap/camB".to_string(),
            },
        ]
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::validate_zones(&toml_config.zones.shelf)
            .with_context(|| format!("Invalid zones in {}", path.display()))?;
        ensure!(
            toml_config.zones.margin >= 0.0,
            "zones.margin must not be negative in {}",
            path.display()
        );

        Ok(Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_frames_topic: toml_config.mqtt.frames_topic,
            mqtt_control_topic: toml_config.mqtt.control_topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            zone_margin: toml_config.zones.margin,
            shelf_zones: toml_config.zones.shelf,
            link_zone: toml_config.identity.link_zone,
            departure_after_frames: toml_config.tracking.departure_after_frames.max(1),
            settle_delay_ms: toml_config.diff.settle_delay_ms,
            reentry_mode: toml_config.diff.reentry,
            shelf_timeout_ms: toml_config.shelf.timeout_ms,
            shelf_width: toml_config.shelf.width,
            shelf_height: toml_config.shelf.height,
            shelf_quality: toml_config.shelf.quality,
            detector_url: toml_config.detector.url,
            detector_confidence: toml_config.detector.confidence,
            detector_iou: toml_config.detector.iou,
            detector_timeout_ms: toml_config.detector.timeout_ms,
            backend_base_url: toml_config.backend.base_url.trim_end_matches('/').to_string(),
            publish_timeout_ms: toml_config.backend.publish_timeout_ms,
            invoice_timeout_ms: toml_config.backend.invoice_timeout_ms,
            egress_queue_size: toml_config.backend.queue_size.max(1),
            invoice_queue_size: toml_config.backend.invoice_queue_size.max(1),
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: path.display().to_string(),
        })
    }

    fn validate_zones(zones: &[ShelfZone]) -> anyhow::Result<()> {
        ensure!(zones.len() <= u16::MAX as usize, "too many zones ({})", zones.len());
        for (i, zone) in zones.iter().enumerate() {
            ensure!(!zone.name.trim().is_empty(), "zone #{} has an empty name", i);
            ensure!(
                zone.rect.x1 <= zone.rect.x2 && zone.rect.y1 <= zone.rect.y2,
                "zone '{}' has inverted bounds",
                zone.name
            );
            ensure!(
                !zones[..i].iter().any(|z| z.name == zone.name),
                "duplicate zone name '{}'",
                zone.name
            );
        }
        Ok(())
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        let config_path = Self::resolve_config_path(args);
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(config_path: &str) -> Self {
        match Self::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_frames_topic(&self) -> &str {
        &self.mqtt_frames_topic
    }

    pub fn mqtt_control_topic(&self) -> &str {
        &self.mqtt_control_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn zone_margin(&self) -> f64 {
        self.zone_margin
    }

    pub fn shelf_zones(&self) -> &[ShelfZone] {
        &self.shelf_zones
    }

    pub fn link_zone(&self) -> Option<Rect> {
        self.link_zone
    }

    pub fn departure_after_frames(&self) -> u32 {
        self.departure_after_frames
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn reentry_mode(&self) -> ReentryMode {
        self.reentry_mode
    }

    pub fn shelf_timeout(&self) -> Duration {
        Duration::from_millis(self.shelf_timeout_ms)
    }

    pub fn shelf_width(&self) -> u32 {
        self.shelf_width
    }

    pub fn shelf_height(&self) -> u32 {
        self.shelf_height
    }

    pub fn shelf_quality(&self) -> u8 {
        self.shelf_quality
    }

    pub fn detector_url(&self) -> &str {
        &self.detector_url
    }

    pub fn detector_confidence(&self) -> f32 {
        self.detector_confidence
    }

    pub fn detector_iou(&self) -> f32 {
        self.detector_iou
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn backend_base_url(&self) -> &str {
        &self.backend_base_url
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn invoice_timeout(&self) -> Duration {
        Duration::from_millis(self.invoice_timeout_ms)
    }

    pub fn egress_queue_size(&self) -> usize {
        self.egress_queue_size
    }

    pub fn invoice_queue_size(&self) -> usize {
        self.invoice_queue_size
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the exit diff delay
    #[cfg(test)]
    pub fn with_settle_delay_ms(mut self, ms: u64) -> Self {
        self.settle_delay_ms = ms;
        self
    }

    #[cfg(test)]
    pub fn with_reentry_mode(mut self, mode: ReentryMode) -> Self {
        self.reentry_mode = mode;
        self
    }

    #[cfg(test)]
    pub fn with_departure_after_frames(mut self, frames: u32) -> Self {
        self.departure_after_frames = frames.max(1);
        self
    }

    #[cfg(test)]
    pub fn with_link_zone(mut self, rect: Option<Rect>) -> Self {
        self.link_zone = rect;
        self
    }

    #[cfg(test)]
    pub fn with_shelf_zones(mut self, zones: Vec<ShelfZone>) -> Self {
        self.shelf_zones = zones;
        self
    }
}
