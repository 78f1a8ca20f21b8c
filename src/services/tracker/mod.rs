//! Shopper tracking and event orchestration
//!
//! The Tracker is the single owner of all per-track state and coordinates:
//! - Zone transitions (enter/exit per shelf zone)
//! - Shelf baselines and the deferred exit diffs
//! - Cart mutations and session publishing
//! - Identity linking from code reads
//! - Settlement when a track disappears
//!
//! Background work reports back through the same event channel as the
//! perception frames, so every mutation happens on this task.

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::types::{TrackId, TrackerEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::EgressSender;
use crate::services::baseline::BaselineStore;
use crate::services::cart_ledger::CartLedger;
use crate::services::identity::IdentityRegistry;
use crate::services::invoice_worker::InvoiceCmd;
use crate::services::settlement::SettlementEngine;
use crate::services::shelf_scanner::ShelfScanner;
use crate::services::zone_machine::ZoneMachine;
use crate::services::zone_resolver::ZoneTable;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tracing::info;

/// Central event processor for shopper tracking and settlement
pub struct Tracker {
    /// Consecutive frames each active track has been missing from
    pub(crate) presence: FxHashMap<TrackId, u32>,
    /// Departed tracks whose settlement waits on an outstanding diff
    pub(crate) departing: FxHashSet<TrackId>,
    pub(crate) zones: ZoneTable,
    pub(crate) zone_machine: ZoneMachine,
    pub(crate) baselines: BaselineStore,
    pub(crate) ledger: CartLedger,
    pub(crate) identities: IdentityRegistry,
    pub(crate) settlement: SettlementEngine,
    pub(crate) config: Config,
    pub(crate) egress: EgressSender,
    pub(crate) metrics: Arc<Metrics>,
}

impl Tracker {
    /// Create a new Tracker; `events` is a weak handle to the tracker's own
    /// input channel, used by background tasks to report results.
    pub fn new(
        config: Config,
        scanner: Arc<ShelfScanner>,
        invoice_tx: mpsc::Sender<InvoiceCmd>,
        egress: EgressSender,
        metrics: Arc<Metrics>,
        events: mpsc::WeakSender<TrackerEvent>,
    ) -> Self {
        let zones = ZoneTable::from_config(&config);
        let baselines =
            BaselineStore::new(scanner, events, config.settle_delay(), config.reentry_mode());
        Self {
            presence: FxHashMap::default(),
            departing: FxHashSet::default(),
            zones,
            zone_machine: ZoneMachine::new(),
            baselines,
            ledger: CartLedger::new(metrics.clone()),
            identities: IdentityRegistry::new(),
            settlement: SettlementEngine::new(invoice_tx, egress.clone(), metrics.clone()),
            config,
            egress,
            metrics,
        }
    }

    /// Consume events until the channel closes or shutdown is signalled
    pub async fn run(
        &mut self,
        mut event_rx: mpsc::Receiver<TrackerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut gauge_interval = interval(Duration::from_secs(1));
        info!(zones = %self.zones.len(), reentry = ?self.config.reentry_mode(), "tracker_started");

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(e) => self.process_event(e),
                        None => break,
                    }
                }
                _ = gauge_interval.tick() => {
                    self.update_gauges();
                    self.metrics.set_event_queue_depth(event_rx.len() as u64);
                }
                _ = shutdown.changed() => break,
            }
        }

        self.baselines.abort_all();
        info!(
            active_tracks = %self.presence.len(),
            deferred = %self.departing.len(),
            invoices_in_flight = %self.settlement.in_flight_count(),
            "tracker_stopped"
        );
    }

    /// Process a single event, dispatching to the appropriate handler
    pub fn process_event(&mut self, event: TrackerEvent) {
        match event {
            TrackerEvent::Frame { frame, received_at } => {
                let process_start = Instant::now();
                self.handle_frame(frame, received_at);
                self.metrics.record_frame_processed(process_start.elapsed().as_micros() as u64);
            }
            TrackerEvent::Control(cmd) => self.handle_control(cmd),
            TrackerEvent::BaselineCaptured { track_id, zone, generation, labels } => {
                self.handle_baseline_captured(track_id, zone, generation, labels);
            }
            TrackerEvent::DiffCaptured { generation, labels } => {
                self.handle_diff_captured(generation, labels);
            }
            TrackerEvent::InvoiceSettled { track_id, outcome } => {
                self.handle_invoice_settled(track_id, outcome);
            }
        }
    }

    fn update_gauges(&self) {
        self.metrics.set_active_tracks(self.presence.len());
        self.metrics.set_pending_diffs(self.baselines.pending_count());
    }

    /// Get current active track count
    pub fn active_tracks(&self) -> usize {
        self.presence.len()
    }
}
