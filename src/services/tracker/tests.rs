//! Tests for the Tracker module

use super::*;
use crate::domain::session::{InvoiceRequest, SubmitError};
use crate::domain::types::{
    CodeRead, ControlCommand, Labels, PerceptionFrame, SessionStatus, TrackObservation,
};
use crate::infra::config::ReentryMode;
use crate::io::egress_channel::{create_egress_channel, EgressMessage, SessionPayload};
use crate::services::invoice_worker::create_invoice_worker;
use crate::services::settlement::InvoiceBackend;
use crate::services::shelf_scanner::{DetectionError, Detector, ShelfImageSource};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const IN_A: (f64, f64) = (480.0, 300.0);
const IN_B: (f64, f64) = (150.0, 200.0);
const AISLE: (f64, f64) = (320.0, 400.0);
const IN_LINK: (f64, f64) = (300.0, 120.0);

/// Shelf camera + detector in one: the "image" is the zone name, and the
/// detector answers with whatever is currently on that shelf.
#[derive(Default)]
struct MockShelf {
    shelves: Mutex<HashMap<String, Labels>>,
    offline: Mutex<Vec<String>>,
}

impl MockShelf {
    fn stock(&self, zone: &str, items: &[&str]) {
        self.shelves
            .lock()
            .insert(zone.to_string(), items.iter().map(|s| s.to_string()).collect());
    }

    fn take_offline(&self, zone: &str) {
        self.offline.lock().push(zone.to_string());
    }
}

#[async_trait]
impl ShelfImageSource for MockShelf {
    async fn fetch(&self, zone_name: &str) -> Option<Bytes> {
        if self.offline.lock().iter().any(|z| z == zone_name) {
            return None;
        }
        Some(Bytes::from(zone_name.to_string()))
    }
}

#[async_trait]
impl Detector for MockShelf {
    async fn detect(&self, image: Bytes) -> Result<Labels, DetectionError> {
        let zone = String::from_utf8_lossy(&image).to_string();
        Ok(self.shelves.lock().get(&zone).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct MockInvoiceBackend {
    calls: Mutex<Vec<InvoiceRequest>>,
    fail: AtomicBool,
    /// Response latency; keeps an invoice in flight across frames
    delay_ms: AtomicU64,
}

#[async_trait]
impl InvoiceBackend for MockInvoiceBackend {
    async fn submit(&self, request: &InvoiceRequest) -> Result<(), SubmitError> {
        self.calls.lock().push(request.clone());
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(SubmitError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

/// Test harness that owns the channel receivers and mock collaborators
struct TestTracker {
    tracker: Tracker,
    event_tx: mpsc::Sender<TrackerEvent>,
    event_rx: mpsc::Receiver<TrackerEvent>,
    egress_rx: mpsc::Receiver<EgressMessage>,
    shelf: Arc<MockShelf>,
    backend: Arc<MockInvoiceBackend>,
    sessions: Vec<SessionPayload>,
    events: Vec<String>,
}

impl std::ops::Deref for TestTracker {
    type Target = Tracker;
    fn deref(&self) -> &Self::Target {
        &self.tracker
    }
}

impl std::ops::DerefMut for TestTracker {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tracker
    }
}

fn create_test_tracker() -> TestTracker {
    create_test_tracker_with_config(Config::default())
}

fn create_test_tracker_with_config(config: Config) -> TestTracker {
    let metrics = Arc::new(Metrics::new());
    let (event_tx, event_rx) = mpsc::channel(256);
    let (egress, egress_rx) = create_egress_channel(1024, metrics.clone());
    let shelf = Arc::new(MockShelf::default());
    let scanner = Arc::new(ShelfScanner::new(shelf.clone(), shelf.clone()));
    let backend = Arc::new(MockInvoiceBackend::default());
    let (invoice_tx, worker) = create_invoice_worker(
        backend.clone(),
        event_tx.downgrade(),
        metrics.clone(),
        Duration::from_secs(5),
        8,
    );
    tokio::spawn(worker.run());
    let tracker = Tracker::new(config, scanner, invoice_tx, egress, metrics, event_tx.downgrade());
    TestTracker {
        tracker,
        event_tx,
        event_rx,
        egress_rx,
        shelf,
        backend,
        sessions: Vec::new(),
        events: Vec::new(),
    }
}

fn frame(tracks: &[(i64, (f64, f64))], codes: &[&str]) -> TrackerEvent {
    TrackerEvent::Frame {
        frame: PerceptionFrame {
            ts: 1_767_631_290_048,
            tracks: tracks.iter().map(|&(id, (x, y))| TrackObservation { id, x, y }).collect(),
            codes: codes
                .iter()
                .map(|text| CodeRead { text: text.to_string(), points: Vec::new() })
                .collect(),
        },
        received_at: Instant::now(),
    }
}

impl TestTracker {
    /// Feed background results back into the tracker until nothing is left
    async fn drain(&mut self) {
        loop {
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
            match self.event_rx.try_recv() {
                Ok(event) => self.tracker.process_event(event),
                Err(_) => break,
            }
        }
        while let Ok(msg) = self.egress_rx.try_recv() {
            match msg {
                EgressMessage::Session(s) => self.sessions.push(s),
                EgressMessage::Event(e) => self.events.push(e.message),
            }
        }
    }

    async fn step(&mut self, tracks: &[(i64, (f64, f64))], codes: &[&str]) {
        self.tracker.process_event(frame(tracks, codes));
        self.drain().await;
    }

    /// Advance the paused clock, letting deferred diffs fire
    async fn wait_ms(&mut self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.drain().await;
    }

    fn last_session(&self, track: i64) -> Option<&SessionPayload> {
        let id = track.to_string();
        self.sessions.iter().rev().find(|s| s.session_id == id)
    }

    fn has_event(&self, message: &str) -> bool {
        self.events.iter().any(|e| e == message)
    }

    fn invoice_calls(&self) -> Vec<InvoiceRequest> {
        self.backend.calls.lock().clone()
    }
}

#[tokio::test(start_paused = true)]
async fn test_direct_move_exits_before_enter() {
    let mut t = create_test_tracker();
    t.step(&[(1, IN_A)], &[]).await;
    t.step(&[(1, IN_B)], &[]).await;

    let zone_events: Vec<&str> =
        t.events.iter().map(String::as_str).filter(|e| e.starts_with("track 1:")).collect();
    assert_eq!(
        zone_events,
        vec!["track 1: entered Table A", "track 1: left Table A", "track 1: entered Table B"]
    );
    let b = t.zones.resolve(crate::domain::types::Point::new(IN_B.0, IN_B.1));
    assert_eq!(t.zone_machine.current(TrackId(1)), b);
}

#[tokio::test(start_paused = true)]
async fn test_taken_items_land_in_cart() {
    let mut t = create_test_tracker();
    t.shelf.stock("Table A", &["Pepsi", "Pepsi", "Chips"]);
    t.step(&[(1, IN_A)], &[]).await;

    t.shelf.stock("Table A", &["Chips"]);
    t.step(&[(1, AISLE)], &[]).await;
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Pepsi"), 0);

    t.wait_ms(2100).await;
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Pepsi"), 2);
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Chips"), 0);
    assert!(t.has_event("track 1: +2 × Pepsi"));

    let session = t.last_session(1).unwrap();
    assert_eq!(session.status, SessionStatus::Processing);
    assert_eq!(session.cart.get("Pepsi"), Some(&2));
    assert_eq!(t.metrics.diffs_applied(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_diff_waits_for_settle_delay() {
    let mut t = create_test_tracker();
    t.shelf.stock("Table A", &["Pepsi"]);
    t.step(&[(1, IN_A)], &[]).await;
    t.step(&[(1, AISLE)], &[]).await;

    // still on the shelf at exit time; taken before the snapshot fires
    t.wait_ms(1000).await;
    t.shelf.stock("Table A", &[]);
    assert_eq!(t.metrics.diffs_applied(), 0);

    t.wait_ms(1100).await;
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Pepsi"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_returned_item_removes_line() {
    let mut t = create_test_tracker();
    t.ledger.add(TrackId(1), "Chips", 1).unwrap();
    t.shelf.stock("Table A", &["Pepsi"]);
    t.step(&[(1, IN_A)], &[]).await;

    t.shelf.stock("Table A", &["Pepsi", "Chips"]);
    t.step(&[(1, AISLE)], &[]).await;
    t.wait_ms(2100).await;

    assert!(t.ledger.snapshot(TrackId(1)).is_empty());
    assert!(t.has_event("track 1: returned Chips"));
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_baseline_skips_diff() {
    let mut t = create_test_tracker();
    t.shelf.stock("Table A", &["Pepsi"]);
    t.shelf.take_offline("Table A");
    t.step(&[(1, IN_A)], &[]).await;
    t.step(&[(1, AISLE)], &[]).await;
    t.wait_ms(2100).await;

    assert!(t.ledger.snapshot(TrackId(1)).is_empty());
    assert_eq!(t.metrics.diffs_applied(), 0);
    assert_eq!(t.metrics.diffs_skipped(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_departure_without_identity_is_unpaid() {
    let mut t = create_test_tracker();
    t.ledger.add(TrackId(1), "Pepsi", 2).unwrap();
    t.step(&[(1, AISLE)], &[]).await;
    t.step(&[], &[]).await;

    assert_eq!(t.active_tracks(), 0);
    assert!(t.invoice_calls().is_empty());
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Pepsi"), 2);

    let session = t.last_session(1).unwrap();
    assert_eq!(session.status, SessionStatus::Unpaid);
    assert_eq!(session.cart.get("Pepsi"), Some(&2));
    assert!(session.customer_name.is_none());
    assert_eq!(t.metrics.settlements_unpaid(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_identified_departure_is_paid() {
    let mut t = create_test_tracker();
    t.ledger.add(TrackId(1), "Pepsi", 2).unwrap();
    t.step(&[(1, IN_LINK)], &["ana"]).await;
    assert_eq!(t.identities.lookup(TrackId(1)).map(|i| i.external_id.as_str()), Some("ana"));

    t.step(&[], &[]).await;

    let calls = t.invoice_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].user_id, "ana");
    assert_eq!(calls[0].items.len(), 1);
    assert_eq!(calls[0].items[0].quantity, 2);

    assert!(t.ledger.snapshot(TrackId(1)).is_empty());
    let session = t.last_session(1).unwrap();
    assert_eq!(session.status, SessionStatus::Paid);
    assert_eq!(session.customer_name.as_deref(), Some("ana"));
    assert!(session.cart.is_empty());
    assert!(t.identities.lookup(TrackId(1)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_invoice_keeps_cart() {
    let mut t = create_test_tracker();
    t.backend.fail.store(true, Ordering::Relaxed);
    t.ledger.add(TrackId(1), "Pepsi", 2).unwrap();
    t.step(&[(1, IN_LINK)], &["ana"]).await;
    t.step(&[], &[]).await;

    assert_eq!(t.invoice_calls().len(), 1);
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Pepsi"), 2);
    assert_eq!(t.last_session(1).unwrap().status, SessionStatus::Unpaid);
    assert_eq!(t.metrics.invoice_failures(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_cart_departure_sends_no_invoice() {
    let mut t = create_test_tracker();
    t.step(&[(1, IN_LINK)], &["ana"]).await;
    t.step(&[], &[]).await;

    assert!(t.invoice_calls().is_empty());
    assert_eq!(t.last_session(1).unwrap().status, SessionStatus::Unpaid);
}

#[tokio::test(start_paused = true)]
async fn test_settlement_deferred_until_diff_resolves() {
    let mut t = create_test_tracker();
    t.shelf.stock("Table A", &["Pepsi"]);
    t.step(&[(1, IN_A)], &[]).await;

    t.shelf.stock("Table A", &[]);
    t.step(&[(1, IN_LINK)], &["ana"]).await;
    t.step(&[], &[]).await;

    assert!(t.departing.contains(&TrackId(1)));
    assert!(t.invoice_calls().is_empty());

    // a reappearing id is ignored while its settlement is pending
    t.step(&[(1, IN_B)], &[]).await;
    assert_eq!(t.active_tracks(), 0);

    t.wait_ms(2100).await;
    assert!(!t.departing.contains(&TrackId(1)));
    let calls = t.invoice_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].items[0].name, "Pepsi");
    assert_eq!(t.last_session(1).unwrap().status, SessionStatus::Paid);
}

#[tokio::test(start_paused = true)]
async fn test_reappearing_id_is_ignored_while_invoice_in_flight() {
    let mut t = create_test_tracker();
    t.backend.delay_ms.store(1000, Ordering::Relaxed);
    t.ledger.add(TrackId(1), "Pepsi", 2).unwrap();
    t.step(&[(1, IN_LINK)], &["ana"]).await;
    t.step(&[], &[]).await;
    assert!(t.settlement.is_in_flight(TrackId(1)));

    // same id comes back, shows the code and leaves again before the answer
    t.step(&[(1, IN_LINK)], &["ana"]).await;
    assert_eq!(t.active_tracks(), 0);
    assert!(t.identities.lookup(TrackId(1)).is_none());
    t.step(&[], &[]).await;

    t.wait_ms(1100).await;
    let calls = t.invoice_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].items[0].quantity, 2);
    assert!(!t.settlement.is_in_flight(TrackId(1)));
    assert_eq!(t.metrics.settlements_paid(), 1);
    assert_eq!(t.last_session(1).unwrap().status, SessionStatus::Paid);

    // once settled the id is a fresh track again
    t.step(&[(1, AISLE)], &[]).await;
    assert_eq!(t.active_tracks(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_accepted_invoice_keeps_unbilled_items() {
    let mut t = create_test_tracker();
    t.backend.delay_ms.store(1000, Ordering::Relaxed);
    t.ledger.add(TrackId(1), "Pepsi", 1).unwrap();
    t.step(&[(1, IN_LINK)], &["ana"]).await;
    t.step(&[], &[]).await;

    t.step(&[(1, AISLE)], &[]).await;
    t.ledger.add(TrackId(1), "Chips", 1).unwrap();
    t.wait_ms(1100).await;

    let calls = t.invoice_calls();
    assert_eq!(calls.len(), 1);
    let billed: Vec<&str> = calls[0].items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(billed, vec!["Pepsi"]);

    let cart = t.ledger.snapshot(TrackId(1));
    assert_eq!(cart.quantity_of("Pepsi"), 0);
    assert_eq!(cart.quantity_of("Chips"), 1);
    let session = t.last_session(1).unwrap();
    assert_eq!(session.status, SessionStatus::Paid);
    assert_eq!(session.cart.get("Chips"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_settle_delay_from_config() {
    let mut t = create_test_tracker_with_config(Config::default().with_settle_delay_ms(500));
    t.shelf.stock("Table A", &["Pepsi"]);
    t.step(&[(1, IN_A)], &[]).await;
    t.shelf.stock("Table A", &[]);
    t.step(&[(1, AISLE)], &[]).await;

    t.wait_ms(600).await;
    assert_eq!(t.metrics.diffs_applied(), 1);
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Pepsi"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_link_zone_leaves_codes_unclaimed() {
    let mut t = create_test_tracker_with_config(Config::default().with_link_zone(None));
    t.step(&[(1, IN_LINK)], &["ana"]).await;
    assert!(t.identities.lookup(TrackId(1)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_departure_inside_zone_discards_baseline() {
    let mut t = create_test_tracker();
    t.shelf.stock("Table A", &["Pepsi"]);
    t.step(&[(1, IN_A)], &[]).await;
    t.shelf.stock("Table A", &[]);
    t.step(&[], &[]).await;
    t.wait_ms(2100).await;

    assert!(t.ledger.snapshot(TrackId(1)).is_empty());
    assert_eq!(t.metrics.diffs_applied(), 0);
    assert_eq!(t.baselines.pending_count(), 0);
    assert!(t.zone_machine.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reentry_carries_baseline_over() {
    let mut t = create_test_tracker();
    t.shelf.stock("Table A", &["Pepsi", "Chips"]);
    t.step(&[(1, IN_A)], &[]).await;

    t.shelf.stock("Table A", &["Chips"]);
    t.step(&[(1, AISLE)], &[]).await;
    t.wait_ms(500).await;
    t.step(&[(1, IN_A)], &[]).await;
    t.wait_ms(2100).await;
    assert_eq!(t.metrics.diffs_applied(), 0);

    t.step(&[(1, AISLE)], &[]).await;
    t.wait_ms(2100).await;
    assert_eq!(t.metrics.diffs_applied(), 1);
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Pepsi"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_independent_reentry_runs_both_diffs() {
    let config = Config::default().with_reentry_mode(ReentryMode::Independent);
    let mut t = create_test_tracker_with_config(config);
    t.shelf.stock("Table A", &["Pepsi", "Chips"]);
    t.step(&[(1, IN_A)], &[]).await;

    t.shelf.stock("Table A", &["Chips"]);
    t.step(&[(1, AISLE)], &[]).await;
    t.wait_ms(500).await;
    t.step(&[(1, IN_A)], &[]).await;
    t.wait_ms(2100).await;

    assert_eq!(t.metrics.diffs_applied(), 1);
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Pepsi"), 1);

    t.step(&[(1, AISLE)], &[]).await;
    t.wait_ms(2100).await;
    assert_eq!(t.metrics.diffs_applied(), 2);
    assert_eq!(t.ledger.snapshot(TrackId(1)).quantity_of("Pepsi"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_identical_relink_publishes_once() {
    let mut t = create_test_tracker();
    t.step(&[(1, IN_LINK)], &["ana"]).await;
    t.step(&[(1, IN_LINK)], &["ana"]).await;

    let links = t.events.iter().filter(|e| e.as_str() == "track 1: linked to ana").count();
    assert_eq!(links, 1);

    t.step(&[(1, IN_LINK)], &["bob"]).await;
    assert_eq!(t.identities.lookup(TrackId(1)).map(|i| i.external_id.as_str()), Some("bob"));
    assert_eq!(t.last_session(1).unwrap().customer_name.as_deref(), Some("bob"));
}

#[tokio::test(start_paused = true)]
async fn test_code_outside_link_zone_is_unclaimed() {
    let mut t = create_test_tracker();
    t.step(&[(1, AISLE)], &["ana"]).await;
    assert!(t.identities.lookup(TrackId(1)).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_selected_track_receives_codes() {
    let mut t = create_test_tracker();
    t.process_event(TrackerEvent::Control(ControlCommand::Select { select: Some(2) }));
    t.step(&[(1, AISLE), (2, AISLE)], &["bob"]).await;

    assert!(t.identities.lookup(TrackId(1)).is_none());
    assert_eq!(t.identities.lookup(TrackId(2)).map(|i| i.external_id.as_str()), Some("bob"));

    // departure clears the selection
    t.step(&[(1, AISLE)], &[]).await;
    assert_eq!(t.identities.selected(), None);
}

#[tokio::test(start_paused = true)]
async fn test_departure_threshold() {
    let config = Config::default().with_departure_after_frames(3);
    let mut t = create_test_tracker_with_config(config);
    t.step(&[(1, AISLE)], &[]).await;
    t.step(&[], &[]).await;
    t.step(&[], &[]).await;
    assert_eq!(t.active_tracks(), 1);

    // seen again: the miss counter resets
    t.step(&[(1, AISLE)], &[]).await;
    t.step(&[], &[]).await;
    t.step(&[], &[]).await;
    assert_eq!(t.active_tracks(), 1);
    t.step(&[], &[]).await;
    assert_eq!(t.active_tracks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown() {
    let t = create_test_tracker();
    let TestTracker { mut tracker, event_tx, event_rx, .. } = t;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        tracker.run(event_rx, shutdown_rx).await;
        tracker
    });
    event_tx.send(frame(&[(1, AISLE)], &[])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown_tx.send(true).unwrap();

    let tracker = handle.await.unwrap();
    assert_eq!(tracker.active_tracks(), 1);
    assert_eq!(tracker.metrics.frames_total(), 1);
}
