//! Per-track carts and the mutations that reach them
//!
//! The ledger only validates and applies; publishing the resulting session
//! snapshot is left to the caller, which knows the track's identity.

use crate::domain::cart::{quantity, Cart, CartChange, ItemName, MalformedMutation};
use crate::domain::session::InvoiceItem;
use crate::domain::types::TrackId;
use crate::infra::metrics::Metrics;
use crate::services::snapshot_diff::SnapshotDiff;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::warn;

pub struct CartLedger {
    carts: FxHashMap<TrackId, Cart>,
    metrics: Arc<Metrics>,
}

impl CartLedger {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { carts: FxHashMap::default(), metrics }
    }

    fn reject(&self, track: TrackId, name: &str, err: MalformedMutation) -> MalformedMutation {
        self.metrics.record_malformed_mutation();
        warn!(track_id = %track, item = %name, error = %err, "malformed_mutation");
        err
    }

    /// Merge `qty` of `name` into the track's cart
    pub fn add(&mut self, track: TrackId, name: &str, qty: i64) -> Result<CartChange, MalformedMutation> {
        let item = ItemName::new(name).map_err(|e| self.reject(track, name, e))?;
        let qty = quantity(qty).map_err(|e| self.reject(track, name, e))?;
        Ok(self.carts.entry(track).or_default().add(&item, qty))
    }

    /// Take one unit back; `Ok(None)` when the item is not in the cart
    pub fn remove_one_or_decrement(
        &mut self,
        track: TrackId,
        name: &str,
    ) -> Result<Option<CartChange>, MalformedMutation> {
        let item = ItemName::new(name).map_err(|e| self.reject(track, name, e))?;
        Ok(self.carts.get_mut(&track).and_then(|cart| cart.remove_one(&item)))
    }

    /// Apply a snapshot diff: missing items are added grouped, returned
    /// items come off one unit at a time
    pub fn apply_diff(&mut self, track: TrackId, diff: &SnapshotDiff) -> Vec<CartChange> {
        let mut changes = Vec::with_capacity(diff.missing.len() + diff.returned.len());
        let mut taken = 0u64;
        let mut returned = 0u64;

        for (name, n) in &diff.missing {
            if let Ok(change) = self.add(track, name, i64::from(*n)) {
                taken += u64::from(*n);
                changes.push(change);
            }
        }
        for (name, n) in &diff.returned {
            for _ in 0..*n {
                match self.remove_one_or_decrement(track, name) {
                    Ok(Some(change)) => {
                        returned += 1;
                        changes.push(change);
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }

        if taken > 0 {
            self.metrics.record_items_taken(taken);
        }
        if returned > 0 {
            self.metrics.record_items_returned(returned);
        }
        changes
    }

    /// Current cart (empty if the track never took anything)
    pub fn snapshot(&self, track: TrackId) -> Cart {
        self.carts.get(&track).cloned().unwrap_or_default()
    }

    pub fn cart(&self, track: TrackId) -> Option<&Cart> {
        self.carts.get(&track)
    }

    /// Empty the track's cart, returning what was in it
    pub fn clear(&mut self, track: TrackId) -> Cart {
        self.carts.remove(&track).unwrap_or_default()
    }

    /// Remove exactly the billed units, returning whatever is left
    pub fn deduct(&mut self, track: TrackId, billed: &[InvoiceItem]) -> Cart {
        let Some(cart) = self.carts.get_mut(&track) else {
            return Cart::new();
        };
        for item in billed {
            let removed = cart.remove_up_to(&item.name, item.quantity);
            if removed < item.quantity {
                warn!(
                    track_id = %track,
                    item = %item.name,
                    billed = %item.quantity,
                    removed = %removed,
                    "billed_quantity_missing"
                );
            }
        }
        if cart.is_empty() {
            self.carts.remove(&track);
            return Cart::new();
        }
        cart.clone()
    }

    pub fn len(&self) -> usize {
        self.carts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.carts.is_empty()
    }
}
