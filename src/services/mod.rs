//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `tracker` - Central event orchestrator owning all per-track state
//! - `zone_resolver` - Point-to-zone resolution
//! - `zone_machine` - Per-track zone transitions
//! - `baseline` - Shelf baselines and deferred exit diffs
//! - `snapshot_diff` - Multiset difference of shelf snapshots
//! - `shelf_scanner` - Shelf image + detector collaborators
//! - `cart_ledger` - Per-track carts
//! - `identity` - Track to identity links
//! - `settlement` - Departure settlement and the invoice backend interface
//! - `invoice_worker` - Async invoice submission worker

pub mod baseline;
pub mod cart_ledger;
pub mod identity;
pub mod invoice_worker;
pub mod settlement;
pub mod shelf_scanner;
pub mod snapshot_diff;
pub mod tracker;
pub mod zone_machine;
pub mod zone_resolver;

// Re-export commonly used types
pub use invoice_worker::{create_invoice_worker, InvoiceCmd, InvoiceWorker};
pub use settlement::InvoiceBackend;
pub use shelf_scanner::ShelfScanner;
pub use tracker::Tracker;
