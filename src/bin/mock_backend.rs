//! Mock backend for local testing
//!
//! In-memory stand-in for the store backend: sessions, the event log and
//! invoice intake. Nothing is persisted.
//!
//! Usage:
//!   cargo run --bin mock-backend
//!   cargo run --bin mock-backend -- --port 8000 --reject-invoices

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const MAX_EVENTS: usize = 100;

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "In-memory backend for sessions, events and invoices")]
struct Args {
    /// Listen port
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Answer every invoice with 503
    #[arg(long)]
    reject_invoices: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionItem {
    name: String,
    sku: String,
    quantity: i64,
    price: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    id: String,
    customer_id: Option<String>,
    customer_name: Option<String>,
    status: String,
    timestamp: String,
    items: Vec<SessionItem>,
}

#[derive(Debug, Deserialize)]
struct SessionUpdate {
    session_id: String,
    #[serde(default)]
    cart: BTreeMap<String, i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    customer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSession {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    customer_id: Option<String>,
    #[serde(default)]
    customer_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventEntry {
    #[serde(default = "now")]
    timestamp: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceItem {
    name: String,
    quantity: i64,
}

#[derive(Debug, Deserialize)]
struct Invoice {
    user_id: String,
    items: Vec<InvoiceItem>,
}

impl Invoice {
    fn validate(&self) -> Result<(), &'static str> {
        if self.user_id.trim().is_empty() {
            return Err("user_id must not be empty");
        }
        if self.items.is_empty() {
            return Err("items must contain at least one entry");
        }
        if self.items.iter().any(|i| i.name.trim().is_empty()) {
            return Err("item name must not be empty");
        }
        if self.items.iter().any(|i| i.quantity <= 0) {
            return Err("item quantity must be positive");
        }
        Ok(())
    }
}

#[derive(Default)]
struct Store {
    sessions: BTreeMap<String, Session>,
    events: VecDeque<EventEntry>,
    invoices: u64,
}

impl Store {
    fn push_event(&mut self, entry: EventEntry) {
        self.events.push_back(entry);
        while self.events.len() > MAX_EVENTS {
            self.events.pop_front();
        }
    }

    /// Replace cart and status wholesale; non-positive quantities are dropped
    fn apply_update(&mut self, update: SessionUpdate) -> Session {
        let session = self.sessions.entry(update.session_id.clone()).or_insert_with(|| Session {
            id: update.session_id.clone(),
            customer_id: None,
            customer_name: None,
            status: "processing".to_string(),
            timestamp: now(),
            items: Vec::new(),
        });
        session.items = update
            .cart
            .into_iter()
            .filter(|(_, qty)| *qty > 0)
            .map(|(name, quantity)| SessionItem { sku: name.clone(), name, quantity, price: 0.0 })
            .collect();
        if let Some(status) = update.status {
            session.status = status;
        }
        if update.customer_name.is_some() {
            session.customer_name = update.customer_name;
        }
        if update.customer_id.is_some() {
            session.customer_id = update.customer_id;
        }
        session.timestamp = now();
        session.clone()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    if let Ok(value) = "application/json".parse() {
        resp.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    resp
}

fn bad_request(detail: impl std::fmt::Display) -> Response<Full<Bytes>> {
    json_response(StatusCode::UNPROCESSABLE_ENTITY, json!({ "detail": detail.to_string() }))
}

fn query_limit(query: Option<&str>) -> usize {
    query
        .unwrap_or("")
        .split('&')
        .filter_map(|kv| kv.strip_prefix("limit="))
        .find_map(|v| v.parse().ok())
        .unwrap_or(MAX_EVENTS)
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    store: Arc<Mutex<Store>>,
    reject_invoices: bool,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let idempotency_key = req
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return Ok(bad_request(e)),
    };

    let resp = match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, json!({ "status": "ok" })),
        (&Method::GET, "/sessions") => {
            let sessions: Vec<Session> = store.lock().sessions.values().cloned().collect();
            json_response(StatusCode::OK, json!(sessions))
        }
        (&Method::POST, "/sessions") => match serde_json::from_slice::<NewSession>(&body) {
            Ok(new) => {
                let id = new.id.unwrap_or_else(|| Uuid::now_v7().to_string());
                let session = Session {
                    id: id.clone(),
                    customer_id: new.customer_id,
                    customer_name: new.customer_name,
                    status: "processing".to_string(),
                    timestamp: now(),
                    items: Vec::new(),
                };
                store.lock().sessions.insert(id, session.clone());
                json_response(StatusCode::CREATED, json!(session))
            }
            Err(e) => bad_request(e),
        },
        (&Method::POST, "/sessions/update") => match serde_json::from_slice::<SessionUpdate>(&body) {
            Ok(update) => {
                let session = store.lock().apply_update(update);
                info!(
                    session_id = %session.id,
                    status = %session.status,
                    lines = %session.items.len(),
                    customer = ?session.customer_name,
                    "session_updated"
                );
                json_response(StatusCode::OK, json!(session))
            }
            Err(e) => bad_request(e),
        },
        (&Method::GET, "/events") => {
            let limit = query_limit(query.as_deref());
            let guard = store.lock();
            let skip = guard.events.len().saturating_sub(limit);
            let events: Vec<&EventEntry> = guard.events.iter().skip(skip).collect();
            json_response(StatusCode::OK, json!(events))
        }
        (&Method::POST, "/events") => match serde_json::from_slice::<EventEntry>(&body) {
            Ok(entry) => {
                info!(message = %entry.message, "event");
                store.lock().push_event(entry);
                json_response(StatusCode::CREATED, json!({ "ok": true }))
            }
            Err(e) => bad_request(e),
        },
        (&Method::POST, "/invoices") => match serde_json::from_slice::<Invoice>(&body) {
            Ok(invoice) => {
                if let Err(detail) = invoice.validate() {
                    warn!(detail = %detail, "invoice_invalid");
                    bad_request(detail)
                } else if reject_invoices {
                    warn!(user_id = %invoice.user_id, "invoice_rejected");
                    json_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        json!({ "detail": "invoicing disabled" }),
                    )
                } else {
                    let mut guard = store.lock();
                    guard.invoices += 1;
                    let invoice_id = format!("INV-{:05}", guard.invoices);
                    info!(
                        invoice_id = %invoice_id,
                        user_id = %invoice.user_id,
                        items = %invoice.items.len(),
                        idempotency_key = ?idempotency_key,
                        "invoice_created"
                    );
                    json_response(StatusCode::CREATED, json!({ "invoice_id": invoice_id }))
                }
            }
            Err(e) => bad_request(e),
        },
        _ => json_response(StatusCode::NOT_FOUND, json!({ "detail": "Not Found" })),
    };
    Ok(resp)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    let store = Arc::new(Mutex::new(Store::default()));

    info!(port = %args.port, reject_invoices = %args.reject_invoices, "mock_backend_started");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let store = store.clone();
        let reject = args.reject_invoices;

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, store.clone(), reject));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "mock_backend_http_error");
            }
        });
    }
}
