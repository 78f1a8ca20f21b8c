//! Invoice worker - submits invoices off the tracker loop
//!
//! The tracker enqueues one command per settlement; the worker performs the
//! HTTP call under a timeout and routes the outcome back into the tracker's
//! event channel so the cart is only ever touched by the tracker.

use crate::domain::session::{InvoiceOutcome, InvoiceRequest, SubmitError};
use crate::domain::types::{TrackId, TrackerEvent};
use crate::infra::metrics::Metrics;
use crate::services::settlement::InvoiceBackend;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// An invoice to be submitted by the worker
#[derive(Debug)]
pub struct InvoiceCmd {
    pub track_id: TrackId,
    pub request: InvoiceRequest,
    /// When the command was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

pub struct InvoiceWorker {
    backend: Arc<dyn InvoiceBackend>,
    cmd_rx: mpsc::Receiver<InvoiceCmd>,
    /// Outcomes go back to the tracker; weak so the worker never keeps it alive
    events: mpsc::WeakSender<TrackerEvent>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl InvoiceWorker {
    pub fn new(
        backend: Arc<dyn InvoiceBackend>,
        cmd_rx: mpsc::Receiver<InvoiceCmd>,
        events: mpsc::WeakSender<TrackerEvent>,
        metrics: Arc<Metrics>,
        timeout: Duration,
    ) -> Self {
        Self { backend, cmd_rx, events, metrics, timeout }
    }

    /// Run the worker, processing commands until the channel closes
    pub async fn run(mut self) {
        info!("invoice_worker_started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            let queue_delay_us = cmd.enqueued_at.elapsed().as_micros() as u64;
            self.metrics.record_invoice_queue_delay(queue_delay_us);

            let start = Instant::now();
            let result = match tokio::time::timeout(self.timeout, self.backend.submit(&cmd.request)).await {
                Ok(result) => result,
                Err(_) => Err(SubmitError::Timeout(self.timeout.as_millis() as u64)),
            };
            let latency_ms = start.elapsed().as_millis() as u64;
            self.metrics.record_invoice_latency(latency_ms);

            let outcome = match result {
                Ok(()) => {
                    info!(
                        track_id = %cmd.track_id,
                        request_id = %cmd.request.request_id,
                        latency_ms = %latency_ms,
                        queue_delay_us = %queue_delay_us,
                        "invoice_accepted"
                    );
                    InvoiceOutcome::Accepted
                }
                Err(e) => {
                    warn!(
                        track_id = %cmd.track_id,
                        request_id = %cmd.request.request_id,
                        kind = %e.kind(),
                        error = %e,
                        latency_ms = %latency_ms,
                        "invoice_failed"
                    );
                    InvoiceOutcome::Failed(e)
                }
            };

            let Some(tx) = self.events.upgrade() else {
                warn!(track_id = %cmd.track_id, "invoice_outcome_dropped");
                continue;
            };
            if tx.send(TrackerEvent::InvoiceSettled { track_id: cmd.track_id, outcome }).await.is_err() {
                warn!(track_id = %cmd.track_id, "invoice_outcome_dropped");
            }
        }

        info!("invoice_worker_stopped");
    }
}

/// Create an invoice command channel and worker
///
/// Returns the sender (for the tracker) and the worker (to be spawned)
pub fn create_invoice_worker(
    backend: Arc<dyn InvoiceBackend>,
    events: mpsc::WeakSender<TrackerEvent>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    buffer_size: usize,
) -> (mpsc::Sender<InvoiceCmd>, InvoiceWorker) {
    let (cmd_tx, cmd_rx) = mpsc::channel(buffer_size);
    let worker = InvoiceWorker::new(backend, cmd_rx, events, metrics, timeout);
    (cmd_tx, worker)
}
