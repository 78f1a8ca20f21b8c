//! IO modules - external system interfaces
//!
//! - `mqtt` - MQTT ingress for perception frames and control messages
//! - `egress_channel` - Typed channel for session/event egress
//! - `backend` - HTTP delivery of sessions, events and invoices
//! - `shelf` - HTTP shelf cameras and detection service
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod backend;
pub mod egress_channel;
pub mod mqtt;
pub mod prometheus;
pub mod shelf;

// Re-export commonly used types
pub use backend::{BackendPublisher, HttpInvoiceClient};
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender};
pub use shelf::{HttpDetector, HttpShelfCamera};
