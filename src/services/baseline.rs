//! Shelf baselines per (track, zone) visit and the deferred exit diffs
//!
//! Every visit gets a generation number. Background work (baseline capture,
//! delayed exit snapshot) reports back tagged with that generation, and a
//! result whose generation is no longer tracked is ignored. Re-keying a visit
//! therefore retires anything still in flight for it.

use crate::domain::types::{Labels, TrackId, TrackerEvent, ZoneId};
use crate::infra::config::ReentryMode;
use crate::services::shelf_scanner::ShelfScanner;
use crate::services::snapshot_diff::{diff, SnapshotDiff};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type VisitKey = (TrackId, ZoneId);

enum VisitState {
    /// Baseline capture in flight; `exited` once the track left the zone
    Capturing { handle: JoinHandle<()>, exited: bool },
    /// Track is in the zone, baseline held
    Open { baseline: Labels },
    /// Track left; the exit snapshot fires after the settle delay
    Settling { baseline: Labels, handle: JoinHandle<()> },
}

struct Visit {
    key: VisitKey,
    zone_name: Arc<str>,
    state: VisitState,
}

impl Visit {
    /// An exit happened and its diff has not resolved yet
    fn is_pending(&self) -> bool {
        matches!(
            self.state,
            VisitState::Settling { .. } | VisitState::Capturing { exited: true, .. }
        )
    }

    fn abort(&self) {
        match &self.state {
            VisitState::Capturing { handle, .. } | VisitState::Settling { handle, .. } => {
                handle.abort()
            }
            VisitState::Open { .. } => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterOutcome {
    /// A fresh baseline capture was dispatched
    Capturing { generation: u64 },
    /// A pending exit diff was cancelled and its baseline reused
    CarriedOver { generation: u64 },
    /// Re-entered while the previous visit's capture was still running
    Resumed { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    DiffScheduled { generation: u64 },
    /// Diff will be scheduled as soon as the baseline lands
    AwaitingBaseline { generation: u64 },
    /// Nothing to diff against (capture failed or never happened)
    NoBaseline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Ready { key: VisitKey },
    DiffScheduled { key: VisitKey },
    Failed { key: VisitKey },
    /// Generation no longer tracked
    Stale,
}

/// Result of a fired exit diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
    pub key: VisitKey,
    /// `None` when the exit snapshot could not be taken
    pub diff: Option<SnapshotDiff>,
}

pub struct BaselineStore {
    visits: FxHashMap<u64, Visit>,
    /// Visit currently attached to a (track, zone) the track is inside
    open: FxHashMap<VisitKey, u64>,
    next_generation: u64,
    scanner: Arc<ShelfScanner>,
    events: mpsc::WeakSender<TrackerEvent>,
    settle_delay: Duration,
    reentry: ReentryMode,
}

impl BaselineStore {
    pub fn new(
        scanner: Arc<ShelfScanner>,
        events: mpsc::WeakSender<TrackerEvent>,
        settle_delay: Duration,
        reentry: ReentryMode,
    ) -> Self {
        Self {
            visits: FxHashMap::default(),
            open: FxHashMap::default(),
            next_generation: 1,
            scanner,
            events,
            settle_delay,
            reentry,
        }
    }

    fn bump(&mut self) -> u64 {
        let g = self.next_generation;
        self.next_generation += 1;
        g
    }

    /// Track entered a zone
    pub fn enter(&mut self, key: VisitKey, zone_name: &str) -> EnterOutcome {
        // a stale open visit for the same key is overwritten
        if let Some(old) = self.open.remove(&key) {
            if let Some(visit) = self.visits.remove(&old) {
                visit.abort();
            }
        }

        if self.reentry == ReentryMode::CarryOver {
            if let Some(outcome) = self.carry_over(key) {
                return outcome;
            }
        }

        let generation = self.bump();
        let zone_name: Arc<str> = Arc::from(zone_name);
        let handle = self.spawn_capture(generation, key, zone_name.clone());
        self.visits.insert(
            generation,
            Visit { key, zone_name, state: VisitState::Capturing { handle, exited: false } },
        );
        self.open.insert(key, generation);
        EnterOutcome::Capturing { generation }
    }

    /// Reattach the newest pending visit for `key`, if any
    fn carry_over(&mut self, key: VisitKey) -> Option<EnterOutcome> {
        let generation = self
            .visits
            .iter()
            .filter(|(_, v)| v.key == key && v.is_pending())
            .map(|(g, _)| *g)
            .max()?;

        let visit = self.visits.get_mut(&generation)?;
        if let VisitState::Capturing { exited, .. } = &mut visit.state {
            *exited = false;
            self.open.insert(key, generation);
            return Some(EnterOutcome::Resumed { generation });
        }

        let visit = self.visits.remove(&generation)?;
        let VisitState::Settling { baseline, handle } = visit.state else {
            return None;
        };
        handle.abort();
        // new generation so a diff result already in the queue is ignored
        let new_generation = self.bump();
        self.visits.insert(
            new_generation,
            Visit { key, zone_name: visit.zone_name, state: VisitState::Open { baseline } },
        );
        self.open.insert(key, new_generation);
        Some(EnterOutcome::CarriedOver { generation: new_generation })
    }

    /// Track left a zone
    pub fn exit(&mut self, key: VisitKey) -> ExitOutcome {
        let Some(generation) = self.open.remove(&key) else {
            return ExitOutcome::NoBaseline;
        };
        let Some(visit) = self.visits.remove(&generation) else {
            return ExitOutcome::NoBaseline;
        };

        match visit.state {
            VisitState::Capturing { handle, .. } => {
                self.visits.insert(
                    generation,
                    Visit { state: VisitState::Capturing { handle, exited: true }, ..visit },
                );
                ExitOutcome::AwaitingBaseline { generation }
            }
            VisitState::Open { baseline } => {
                self.schedule_diff(generation, visit.key, visit.zone_name, baseline);
                ExitOutcome::DiffScheduled { generation }
            }
            VisitState::Settling { .. } => {
                // open never points at a settling visit
                self.visits.insert(generation, visit);
                ExitOutcome::NoBaseline
            }
        }
    }

    fn schedule_diff(&mut self, generation: u64, key: VisitKey, zone_name: Arc<str>, baseline: Labels) {
        let handle = self.spawn_exit_snapshot(generation, zone_name.clone());
        self.visits.insert(
            generation,
            Visit { key, zone_name, state: VisitState::Settling { baseline, handle } },
        );
    }

    /// Baseline capture for `generation` finished (`None` = unavailable)
    pub fn on_baseline_captured(&mut self, generation: u64, labels: Option<Labels>) -> CaptureOutcome {
        let Some(visit) = self.visits.remove(&generation) else {
            return CaptureOutcome::Stale;
        };
        let key = visit.key;

        let exited = match visit.state {
            VisitState::Capturing { exited, .. } => exited,
            other => {
                self.visits.insert(generation, Visit { state: other, ..visit });
                return CaptureOutcome::Stale;
            }
        };

        let Some(baseline) = labels else {
            if self.open.get(&key) == Some(&generation) {
                self.open.remove(&key);
            }
            return CaptureOutcome::Failed { key };
        };

        if exited {
            self.schedule_diff(generation, key, visit.zone_name, baseline);
            CaptureOutcome::DiffScheduled { key }
        } else {
            self.visits.insert(
                generation,
                Visit { key, zone_name: visit.zone_name, state: VisitState::Open { baseline } },
            );
            CaptureOutcome::Ready { key }
        }
    }

    /// Exit snapshot for `generation` was taken; `None` if superseded
    pub fn on_diff_captured(&mut self, generation: u64, labels: Option<Labels>) -> Option<DiffOutcome> {
        if !matches!(
            self.visits.get(&generation).map(|v| &v.state),
            Some(VisitState::Settling { .. })
        ) {
            return None;
        }
        let visit = self.visits.remove(&generation)?;
        let VisitState::Settling { baseline, .. } = visit.state else {
            return None;
        };
        let diff = labels.map(|current| diff(&baseline, &current));
        Some(DiffOutcome { key: visit.key, diff })
    }

    /// Any exit for this track still waiting on a diff
    pub fn has_pending(&self, track: TrackId) -> bool {
        self.visits.values().any(|v| v.key.0 == track && v.is_pending())
    }

    /// Drop every visit of a track that is not waiting on a diff
    pub fn discard_open(&mut self, track: TrackId) -> usize {
        self.open.retain(|key, _| key.0 != track);
        let before = self.visits.len();
        self.visits.retain(|_, v| {
            if v.key.0 != track || v.is_pending() {
                return true;
            }
            v.abort();
            false
        });
        before - self.visits.len()
    }

    pub fn pending_count(&self) -> usize {
        self.visits.values().filter(|v| v.is_pending()).count()
    }

    pub fn has_baseline(&self, key: VisitKey) -> bool {
        self.open
            .get(&key)
            .and_then(|g| self.visits.get(g))
            .is_some_and(|v| matches!(v.state, VisitState::Open { .. }))
    }

    /// Abort all background work (shutdown)
    pub fn abort_all(&mut self) {
        for visit in self.visits.values() {
            visit.abort();
        }
        self.visits.clear();
        self.open.clear();
    }

    fn spawn_capture(&self, generation: u64, key: VisitKey, zone_name: Arc<str>) -> JoinHandle<()> {
        let scanner = self.scanner.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let labels = match scanner.scan(&zone_name).await {
                Ok(labels) => Some(labels),
                Err(e) => {
                    warn!(track_id = %key.0, zone = %zone_name, error = %e, "baseline_unavailable");
                    None
                }
            };
            if let Some(tx) = events.upgrade() {
                let _ = tx
                    .send(TrackerEvent::BaselineCaptured {
                        track_id: key.0,
                        zone: key.1,
                        generation,
                        labels,
                    })
                    .await;
            }
        })
    }

    fn spawn_exit_snapshot(&self, generation: u64, zone_name: Arc<str>) -> JoinHandle<()> {
        let scanner = self.scanner.clone();
        let events = self.events.clone();
        let delay = self.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let labels = match scanner.scan(&zone_name).await {
                Ok(labels) => Some(labels),
                Err(e) => {
                    warn!(zone = %zone_name, generation = %generation, error = %e, "exit_snapshot_unavailable");
                    None
                }
            };
            debug!(zone = %zone_name, generation = %generation, "exit_snapshot_taken");
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(TrackerEvent::DiffCaptured { generation, labels }).await;
            }
        })
    }
}

impl Drop for BaselineStore {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::shelf_scanner::{DetectionError, Detector, ShelfImageSource};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct NoImage;

    #[async_trait]
    impl ShelfImageSource for NoImage {
        async fn fetch(&self, _zone_name: &str) -> Option<Bytes> {
            None
        }
    }

    struct NoDetector;

    #[async_trait]
    impl Detector for NoDetector {
        async fn detect(&self, _image: Bytes) -> Result<Labels, DetectionError> {
            Ok(Vec::new())
        }
    }

    const KEY: VisitKey = (TrackId(7), ZoneId(0));

    fn labels(items: &[&str]) -> Labels {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Store whose background tasks report into a channel nobody reads;
    /// tests drive completions by hand.
    fn store(reentry: ReentryMode) -> (BaselineStore, mpsc::Sender<TrackerEvent>) {
        let (tx, _rx) = mpsc::channel(16);
        let scanner = Arc::new(ShelfScanner::new(Arc::new(NoImage), Arc::new(NoDetector)));
        let store = BaselineStore::new(scanner, tx.downgrade(), Duration::from_secs(2), reentry);
        (store, tx)
    }

    #[tokio::test]
    async fn test_enter_capture_exit_diff() {
        let (mut s, _tx) = store(ReentryMode::CarryOver);
        let EnterOutcome::Capturing { generation } = s.enter(KEY, "Table A") else {
            panic!("expected capture");
        };
        assert_eq!(
            s.on_baseline_captured(generation, Some(labels(&["Pepsi", "Pepsi", "Chips"]))),
            CaptureOutcome::Ready { key: KEY }
        );
        assert!(s.has_baseline(KEY));
        assert!(!s.has_pending(KEY.0));

        assert_eq!(s.exit(KEY), ExitOutcome::DiffScheduled { generation });
        assert!(s.has_pending(KEY.0));

        let out = s.on_diff_captured(generation, Some(labels(&["Chips"]))).unwrap();
        assert_eq!(out.key, KEY);
        assert_eq!(out.diff.unwrap().missing, vec![("Pepsi".to_string(), 2)]);
        assert!(!s.has_pending(KEY.0));
        assert_eq!(s.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_while_capturing_schedules_on_arrival() {
        let (mut s, _tx) = store(ReentryMode::CarryOver);
        let EnterOutcome::Capturing { generation } = s.enter(KEY, "Table A") else {
            panic!("expected capture");
        };
        assert_eq!(s.exit(KEY), ExitOutcome::AwaitingBaseline { generation });
        assert!(s.has_pending(KEY.0));

        assert_eq!(
            s.on_baseline_captured(generation, Some(labels(&["Pepsi"]))),
            CaptureOutcome::DiffScheduled { key: KEY }
        );
        let out = s.on_diff_captured(generation, Some(labels(&[]))).unwrap();
        assert_eq!(out.diff.unwrap().missing_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_capture_leaves_nothing() {
        let (mut s, _tx) = store(ReentryMode::CarryOver);
        let EnterOutcome::Capturing { generation } = s.enter(KEY, "Table A") else {
            panic!("expected capture");
        };
        assert_eq!(s.on_baseline_captured(generation, None), CaptureOutcome::Failed { key: KEY });
        assert!(!s.has_baseline(KEY));
        assert_eq!(s.exit(KEY), ExitOutcome::NoBaseline);
        assert!(!s.has_pending(KEY.0));
    }

    #[tokio::test]
    async fn test_failed_exit_snapshot_skips_diff() {
        let (mut s, _tx) = store(ReentryMode::CarryOver);
        let EnterOutcome::Capturing { generation } = s.enter(KEY, "Table A") else {
            panic!("expected capture");
        };
        s.on_baseline_captured(generation, Some(labels(&["Pepsi"])));
        s.exit(KEY);
        let out = s.on_diff_captured(generation, None).unwrap();
        assert_eq!(out.diff, None);
        assert!(!s.has_pending(KEY.0));
    }

    #[tokio::test]
    async fn test_carry_over_cancels_pending_diff() {
        let (mut s, _tx) = store(ReentryMode::CarryOver);
        let EnterOutcome::Capturing { generation } = s.enter(KEY, "Table A") else {
            panic!("expected capture");
        };
        s.on_baseline_captured(generation, Some(labels(&["Pepsi", "Chips"])));
        s.exit(KEY);

        let EnterOutcome::CarriedOver { generation: carried } = s.enter(KEY, "Table A") else {
            panic!("expected carry over");
        };
        assert_ne!(carried, generation);
        assert!(s.has_baseline(KEY));
        assert!(!s.has_pending(KEY.0));
        // the old diff result is ignored
        assert_eq!(s.on_diff_captured(generation, Some(labels(&[]))), None);

        // one diff reconciles both visits against the first baseline
        assert_eq!(s.exit(KEY), ExitOutcome::DiffScheduled { generation: carried });
        let out = s.on_diff_captured(carried, Some(labels(&["Chips"]))).unwrap();
        assert_eq!(out.diff.unwrap().missing, vec![("Pepsi".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_independent_reentry_keeps_both_diffs() {
        let (mut s, _tx) = store(ReentryMode::Independent);
        let EnterOutcome::Capturing { generation: first } = s.enter(KEY, "Table A") else {
            panic!("expected capture");
        };
        s.on_baseline_captured(first, Some(labels(&["Pepsi"])));
        s.exit(KEY);

        let EnterOutcome::Capturing { generation: second } = s.enter(KEY, "Table A") else {
            panic!("expected a fresh capture");
        };
        assert_ne!(first, second);
        assert!(s.has_pending(KEY.0));
        assert!(s.on_diff_captured(first, Some(labels(&[]))).is_some());
        assert_eq!(s.on_baseline_captured(second, Some(labels(&[]))), CaptureOutcome::Ready { key: KEY });
    }

    #[tokio::test]
    async fn test_reentry_while_capturing_resumes() {
        let (mut s, _tx) = store(ReentryMode::CarryOver);
        let EnterOutcome::Capturing { generation } = s.enter(KEY, "Table A") else {
            panic!("expected capture");
        };
        s.exit(KEY);
        assert_eq!(s.enter(KEY, "Table A"), EnterOutcome::Resumed { generation });
        assert!(!s.has_pending(KEY.0));
        assert_eq!(
            s.on_baseline_captured(generation, Some(labels(&["Pepsi"]))),
            CaptureOutcome::Ready { key: KEY }
        );
    }

    #[tokio::test]
    async fn test_discard_open_keeps_pending() {
        let (mut s, _tx) = store(ReentryMode::CarryOver);
        let other: VisitKey = (TrackId(7), ZoneId(1));
        let EnterOutcome::Capturing { generation } = s.enter(KEY, "Table A") else {
            panic!("expected capture");
        };
        s.on_baseline_captured(generation, Some(labels(&["Pepsi"])));
        s.exit(KEY);
        s.enter(other, "Table B");

        assert_eq!(s.discard_open(TrackId(7)), 1);
        assert!(s.has_pending(TrackId(7)));
        assert!(!s.has_baseline(other));
    }

    #[tokio::test]
    async fn test_stale_capture_ignored() {
        let (mut s, _tx) = store(ReentryMode::CarryOver);
        assert_eq!(s.on_baseline_captured(99, Some(labels(&["Pepsi"]))), CaptureOutcome::Stale);
        assert_eq!(s.on_diff_captured(99, None), None);
    }
}
