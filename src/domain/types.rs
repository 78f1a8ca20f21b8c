//! Shared types for the store gateway

use crate::domain::session::InvoiceOutcome;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for track IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TrackId(pub i64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into the zone table built at config load.
///
/// Only `ZoneTable` hands these out, so every `ZoneId` in circulation names a
/// configured zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ZoneId(pub(crate) u16);

impl ZoneId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Image-plane point (pixels)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn dist2(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// Axis-aligned rectangle `[x1, y1, x2, y2]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Rect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Rect {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Inclusive containment with the rectangle grown by `margin` on every side
    #[inline]
    pub fn contains_with_margin(&self, p: &Point, margin: f64) -> bool {
        (self.x1 - margin) <= p.x
            && p.x <= (self.x2 + margin)
            && (self.y1 - margin) <= p.y
            && p.y <= (self.y2 + margin)
    }

    #[inline]
    pub fn contains(&self, p: &Point) -> bool {
        self.contains_with_margin(p, 0.0)
    }

    #[inline]
    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

impl From<[f64; 4]> for Rect {
    fn from(v: [f64; 4]) -> Self {
        Rect::new(v[0], v[1], v[2], v[3])
    }
}

impl From<Rect> for [f64; 4] {
    fn from(r: Rect) -> Self {
        [r.x1, r.y1, r.x2, r.y2]
    }
}

/// One person observation inside a perception frame
#[derive(Debug, Clone, Deserialize)]
pub struct TrackObservation {
    pub id: i64,
    pub x: f64,
    pub y: f64,
}

impl TrackObservation {
    #[inline]
    pub fn track_id(&self) -> TrackId {
        TrackId(self.id)
    }

    #[inline]
    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// Decoded optical code as reported by the upstream code reader
#[derive(Debug, Clone, Deserialize)]
pub struct CodeRead {
    pub text: String,
    /// Corner points of the code in the reader's image
    #[serde(default)]
    pub points: Vec<[f64; 2]>,
}

/// Frame timestamps arrive either as epoch ms or as an RFC 3339 string
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    EpochMs(u64),
    Iso(String),
}

/// Parse an RFC 3339 timestamp to epoch milliseconds
pub fn parse_iso_time(time_str: &str) -> Option<u64> {
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .map(|dt| (dt.unix_timestamp_nanos() / 1_000_000) as u64)
}

fn deserialize_frame_ts<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawTimestamp>::deserialize(deserializer)? {
        Some(RawTimestamp::EpochMs(ms)) => ms,
        Some(RawTimestamp::Iso(s)) => parse_iso_time(&s).unwrap_or(0),
        None => 0,
    })
}

/// Perception frame as published on the frames topic
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PerceptionFrame {
    /// Capture time (epoch ms); 0 when the producer does not stamp frames
    #[serde(default, deserialize_with = "deserialize_frame_ts")]
    pub ts: u64,
    #[serde(default)]
    pub tracks: Vec<TrackObservation>,
    #[serde(default)]
    pub codes: Vec<CodeRead>,
}

/// Operator commands published on the control topic
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ControlCommand {
    /// Choose (or clear) the track that receives every code read
    Select { select: Option<i64> },
}

/// Item labels reported by the detector, in detector order
pub type Labels = Vec<String>;

/// Everything the tracker actor consumes, from the outside world and from
/// its own background tasks.
#[derive(Debug)]
pub enum TrackerEvent {
    Frame { frame: PerceptionFrame, received_at: Instant },
    Control(ControlCommand),
    /// Baseline capture for an enter finished
    BaselineCaptured {
        track_id: TrackId,
        zone: ZoneId,
        generation: u64,
        labels: Option<Labels>,
    },
    /// The delayed exit snapshot was taken
    DiffCaptured { generation: u64, labels: Option<Labels> },
    InvoiceSettled { track_id: TrackId, outcome: InvoiceOutcome },
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Frame { .. } => "frame",
            TrackerEvent::Control(_) => "control",
            TrackerEvent::BaselineCaptured { .. } => "baseline_captured",
            TrackerEvent::DiffCaptured { .. } => "diff_captured",
            TrackerEvent::InvoiceSettled { .. } => "invoice_settled",
        }
    }
}

/// Session status as exposed to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Processing,
    Paid,
    Unpaid,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Processing => "processing",
            SessionStatus::Paid => "paid",
            SessionStatus::Unpaid => "unpaid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_margin_is_inclusive() {
        let r = Rect::new(10.0, 10.0, 20.0, 20.0);
        assert!(r.contains(&Point::new(10.0, 20.0)));
        assert!(!r.contains(&Point::new(9.0, 15.0)));
        assert!(r.contains_with_margin(&Point::new(5.0, 15.0), 5.0));
        assert!(!r.contains_with_margin(&Point::new(4.9, 15.0), 5.0));
    }

    #[test]
    fn test_rect_deserializes_from_array() {
        #[derive(Deserialize)]
        struct Wrap {
            rect: Rect,
        }
        let w: Wrap = toml::from_str("rect = [1.0, 2.0, 3.0, 4.0]").unwrap();
        assert_eq!(w.rect, Rect::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(w.rect.center(), Point::new(2.0, 3.0));
    }

    #[test]
    fn test_parse_frame() {
        let json = r#"{"ts": 1767617600000,
            "tracks": [{"id": 7, "x": 480.0, "y": 300.0}],
            "codes": [{"text": " user-42 ", "points": [[1.0, 2.0], [3.0, 4.0]]}]}"#;
        let frame: PerceptionFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.tracks.len(), 1);
        assert_eq!(frame.tracks[0].track_id(), TrackId(7));
        assert_eq!(frame.codes[0].text, " user-42 ");
        assert_eq!(frame.codes[0].points.len(), 2);
    }

    #[test]
    fn test_parse_frame_defaults() {
        let frame: PerceptionFrame = serde_json::from_str("{}").unwrap();
        assert_eq!(frame.ts, 0);
        assert!(frame.tracks.is_empty());
        assert!(frame.codes.is_empty());
    }

    #[test]
    fn test_parse_frame_iso_timestamp() {
        let frame: PerceptionFrame =
            serde_json::from_str(r#"{"ts": "2026-01-05T16:41:30.048+00:00", "tracks": []}"#)
                .unwrap();
        assert_eq!(frame.ts, 1_767_631_290_048);

        let frame: PerceptionFrame = serde_json::from_str(r#"{"ts": "yesterday"}"#).unwrap();
        assert_eq!(frame.ts, 0);
    }

    #[test]
    fn test_parse_control() {
        let cmd: ControlCommand = serde_json::from_str(r#"{"select": 12}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Select { select: Some(12) });
        let cmd: ControlCommand = serde_json::from_str(r#"{"select": null}"#).unwrap();
        assert_eq!(cmd, ControlCommand::Select { select: None });
    }

    #[test]
    fn test_session_status_serde() {
        assert_eq!(serde_json::to_string(&SessionStatus::Unpaid).unwrap(), "\"unpaid\"");
        assert_eq!(SessionStatus::Processing.as_str(), "processing");
    }
}
