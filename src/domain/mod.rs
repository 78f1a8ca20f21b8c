//! Domain models - core store types
//!
//! - `types` - tracks, zones, geometry, perception frames, tracker events
//! - `cart` - validated item names and cart lines
//! - `session` - identities, invoices and settlement outcomes

pub mod cart;
pub mod session;
pub mod types;
