//! Settlement of a departed track's cart into an invoice

use crate::domain::cart::Cart;
use crate::domain::session::{Identity, InvoiceItem, InvoiceOutcome, InvoiceRequest, SubmitError};
use crate::domain::types::{SessionStatus, TrackId};
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::EgressSender;
use crate::services::cart_ledger::CartLedger;
use crate::services::invoice_worker::InvoiceCmd;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};
use uuid::Uuid;

/// Accepts invoices; `Ok` means the backend took it (2xx)
#[async_trait]
pub trait InvoiceBackend: Send + Sync {
    async fn submit(&self, request: &InvoiceRequest) -> Result<(), SubmitError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementDecision {
    NoIdentity,
    EmptyCart,
    Submit(InvoiceRequest),
}

impl SettlementDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementDecision::NoIdentity => "no_identity",
            SettlementDecision::EmptyCart => "empty_cart",
            SettlementDecision::Submit(_) => "submit",
        }
    }
}

/// Identity is checked first: an anonymous empty cart is still `NoIdentity`
pub fn decide(identity: Option<&Identity>, cart: &Cart) -> SettlementDecision {
    let Some(identity) = identity else {
        return SettlementDecision::NoIdentity;
    };
    match InvoiceRequest::from_cart(identity, cart) {
        Some(request) => SettlementDecision::Submit(request),
        None => SettlementDecision::EmptyCart,
    }
}

struct InFlight {
    request_id: Uuid,
    identity: Identity,
    /// Exactly what the request bills; only these units leave the cart on success
    billed: Vec<InvoiceItem>,
}

pub struct SettlementEngine {
    invoice_tx: mpsc::Sender<InvoiceCmd>,
    egress: EgressSender,
    metrics: Arc<Metrics>,
    in_flight: FxHashMap<TrackId, InFlight>,
}

impl SettlementEngine {
    pub fn new(invoice_tx: mpsc::Sender<InvoiceCmd>, egress: EgressSender, metrics: Arc<Metrics>) -> Self {
        Self { invoice_tx, egress, metrics, in_flight: FxHashMap::default() }
    }

    /// Settle a departed track. Returns true while an invoice is in flight;
    /// its outcome arrives later through [`SettlementEngine::complete`].
    ///
    /// At most one invoice per track is outstanding: a second settlement for
    /// a track still in flight is refused.
    pub fn settle(&mut self, track: TrackId, identity: Option<Identity>, ledger: &mut CartLedger) -> bool {
        if let Some(pending) = self.in_flight.get(&track) {
            warn!(track_id = %track, request_id = %pending.request_id, "settlement_already_in_flight");
            return true;
        }
        let decision = decide(identity.as_ref(), &ledger.snapshot(track));
        info!(track_id = %track, decision = %decision.as_str(), "settlement_started");

        match (decision, identity) {
            (SettlementDecision::Submit(request), Some(identity)) => {
                let items: u32 = request.items.iter().map(|i| i.quantity).sum();
                let request_id = request.request_id;
                let billed = request.items.clone();
                let cmd = InvoiceCmd { track_id: track, request, enqueued_at: Instant::now() };
                match self.invoice_tx.try_send(cmd) {
                    Ok(()) => {
                        self.egress.post_event(format!(
                            "track {track} ({}): invoice submitted ({items} items)",
                            identity.display_name
                        ));
                        self.in_flight.insert(track, InFlight { request_id, identity, billed });
                        true
                    }
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                        // still counts as the single attempt
                        self.in_flight.insert(track, InFlight { request_id, identity, billed });
                        self.complete(track, InvoiceOutcome::Failed(SubmitError::QueueFull), ledger);
                        false
                    }
                }
            }
            (SettlementDecision::EmptyCart, identity) => {
                ledger.clear(track);
                let customer = identity.as_ref().map(|i| (i.external_id.as_str(), i.display_name.as_str()));
                self.egress.publish_session(track, &Cart::new(), SessionStatus::Unpaid, customer);
                self.egress.post_event(format!("track {track}: left with an empty cart, unpaid"));
                self.metrics.record_settlement(false);
                false
            }
            (_, _) => {
                let cart = ledger.snapshot(track);
                self.egress.publish_session(track, &cart, SessionStatus::Unpaid, None);
                self.egress.post_event(format!(
                    "track {track}: left without identity, unpaid ({} lines kept)",
                    cart.len()
                ));
                self.metrics.record_settlement(false);
                false
            }
        }
    }

    /// Apply an invoice outcome; outcomes for tracks not in flight are ignored
    pub fn complete(&mut self, track: TrackId, outcome: InvoiceOutcome, ledger: &mut CartLedger) -> Option<SessionStatus> {
        let Some(InFlight { request_id, identity, billed }) = self.in_flight.remove(&track) else {
            warn!(track_id = %track, "invoice_outcome_unexpected");
            return None;
        };
        let customer = Some((identity.external_id.as_str(), identity.display_name.as_str()));
        let accepted = outcome.is_accepted();

        let status = match outcome {
            InvoiceOutcome::Accepted => {
                let remaining = ledger.deduct(track, &billed);
                if !remaining.is_empty() {
                    warn!(track_id = %track, request_id = %request_id, lines = %remaining.len(), "unbilled_lines_kept");
                }
                self.egress.publish_session(track, &remaining, SessionStatus::Paid, customer);
                self.egress.post_event(format!(
                    "track {track} ({}): invoice accepted, paid",
                    identity.display_name
                ));
                info!(track_id = %track, request_id = %request_id, lines = %billed.len(), "settlement_paid");
                SessionStatus::Paid
            }
            InvoiceOutcome::Failed(e) => {
                self.metrics.record_invoice_failure();
                let cart = ledger.snapshot(track);
                self.egress.publish_session(track, &cart, SessionStatus::Unpaid, customer);
                self.egress.post_event(format!(
                    "track {track} ({}): invoice failed ({}), unpaid",
                    identity.display_name,
                    e.kind()
                ));
                warn!(track_id = %track, request_id = %request_id, error = %e, "settlement_unpaid");
                SessionStatus::Unpaid
            }
        };
        self.metrics.record_settlement(accepted);
        Some(status)
    }

    pub fn is_in_flight(&self, track: TrackId) -> bool {
        self.in_flight.contains_key(&track)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
