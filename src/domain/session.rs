//! Identity, invoice and settlement outcome types

use crate::domain::cart::Cart;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// External customer identity linked to a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub external_id: String,
    pub display_name: String,
}

impl Identity {
    /// Code-read text doubles as both id and display name, verbatim
    pub fn from_code(text: &str) -> Option<Self> {
        if text.is_empty() {
            return None;
        }
        Some(Self { external_id: text.to_string(), display_name: text.to_string() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceItem {
    pub name: String,
    pub quantity: u32,
}

/// Invoice body sent to the backend; built only at settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceRequest {
    /// Sent as the Idempotency-Key header, not part of the body
    #[serde(skip)]
    pub request_id: Uuid,
    pub user_id: String,
    pub items: Vec<InvoiceItem>,
}

impl InvoiceRequest {
    /// Build from a non-empty cart; `None` if there is nothing to bill
    pub fn from_cart(identity: &Identity, cart: &Cart) -> Option<Self> {
        if cart.is_empty() {
            return None;
        }
        let items = cart
            .lines()
            .iter()
            .map(|l| InvoiceItem { name: l.name.as_str().to_string(), quantity: l.quantity })
            .collect();
        Some(Self { request_id: Uuid::now_v7(), user_id: identity.external_id.clone(), items })
    }
}

/// Why an invoice submission did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("invoice queue full")]
    QueueFull,
}

impl SubmitError {
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::Transport(_) => "transport",
            SubmitError::Rejected { .. } => "rejected",
            SubmitError::Timeout(_) => "timeout",
            SubmitError::QueueFull => "queue_full",
        }
    }
}

/// Result of one invoice attempt, routed back into the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceOutcome {
    Accepted,
    Failed(SubmitError),
}

impl InvoiceOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, InvoiceOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cart::ItemName;
    use std::num::NonZeroU32;

    #[test]
    fn test_identity_from_code_is_verbatim() {
        let id = Identity::from_code("user-42").unwrap();
        assert_eq!(id.external_id, "user-42");
        assert_eq!(id.display_name, "user-42");
        let padded = Identity::from_code(" user-42 ").unwrap();
        assert_eq!(padded.external_id, " user-42 ");
        assert!(Identity::from_code("").is_none());
    }

    #[test]
    fn test_outcome_is_accepted() {
        assert!(InvoiceOutcome::Accepted.is_accepted());
        assert!(!InvoiceOutcome::Failed(SubmitError::QueueFull).is_accepted());
    }

    #[test]
    fn test_invoice_request_from_cart() {
        let identity = Identity::from_code("user-42").unwrap();
        let mut cart = Cart::new();
        assert!(InvoiceRequest::from_cart(&identity, &cart).is_none());

        cart.add(&ItemName::new("Pepsi").unwrap(), NonZeroU32::new(2).unwrap());
        let req = InvoiceRequest::from_cart(&identity, &cart).unwrap();
        assert_eq!(req.user_id, "user-42");
        assert_eq!(req.items, vec![InvoiceItem { name: "Pepsi".into(), quantity: 2 }]);
        assert_eq!(req.request_id.get_version_num(), 7);
    }

    #[test]
    fn test_invoice_body_shape() {
        let identity = Identity::from_code("user-42").unwrap();
        let mut cart = Cart::new();
        cart.add(&ItemName::new("Chips").unwrap(), NonZeroU32::new(1).unwrap());
        let req = InvoiceRequest::from_cart(&identity, &cart).unwrap();

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"user_id": "user-42", "items": [{"name": "Chips", "quantity": 1}]})
        );
    }
}
