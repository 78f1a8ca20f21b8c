//! HTTP delivery to the store backend
//!
//! - `BackendPublisher` drains the egress channel and POSTs session snapshots
//!   to `/sessions/update` and event lines to `/events`
//! - `HttpInvoiceClient` submits invoices to `/invoices`
//!
//! Both are best-effort: failures are logged and counted, never retried.

use crate::domain::session::{InvoiceRequest, SubmitError};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::EgressMessage;
use crate::services::settlement::InvoiceBackend;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Rejection bodies are kept for the log, not in full
const MAX_ERROR_BODY: usize = 256;

fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .http1_only()
        .build()
        .context("Failed to build HTTP client")
}

/// Backend publisher actor
///
/// Receives messages from the egress channel and delivers them in order.
pub struct BackendPublisher {
    client: reqwest::Client,
    rx: mpsc::Receiver<EgressMessage>,
    sessions_url: String,
    events_url: String,
    metrics: Arc<Metrics>,
}

impl BackendPublisher {
    pub fn new(
        config: &Config,
        rx: mpsc::Receiver<EgressMessage>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let base = config.backend_base_url();
        Ok(Self {
            client: build_client(config.publish_timeout())?,
            rx,
            sessions_url: format!("{base}/sessions/update"),
            events_url: format!("{base}/events"),
            metrics,
        })
    }

    /// Run the publisher loop until shutdown or until every sender is gone
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(sessions = %self.sessions_url, events = %self.events_url, "backend_publisher_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("backend_publisher_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.deliver(msg).await;
                        }
                        return;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.deliver(msg).await,
                        None => {
                            info!("backend_publisher_channel_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn deliver(&self, msg: EgressMessage) {
        let kind = msg.as_str();
        let request = match &msg {
            EgressMessage::Session(payload) => self.client.post(&self.sessions_url).json(payload),
            EgressMessage::Event(payload) => self.client.post(&self.events_url).json(payload),
        };

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(kind = %kind, "backend_delivered");
            }
            Ok(resp) => {
                self.metrics.record_egress_failed();
                warn!(kind = %kind, status = %resp.status().as_u16(), "backend_delivery_rejected");
            }
            Err(e) => {
                self.metrics.record_egress_failed();
                warn!(kind = %kind, error = %e, "backend_delivery_failed");
            }
        }
    }
}

/// Invoice submission over HTTP
pub struct HttpInvoiceClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpInvoiceClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(config.invoice_timeout())?,
            url: format!("{}/invoices", config.backend_base_url()),
            timeout: config.invoice_timeout(),
        })
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl InvoiceBackend for HttpInvoiceClient {
    async fn submit(&self, request: &InvoiceRequest) -> Result<(), SubmitError> {
        let start = Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", request.request_id.to_string())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SubmitError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    SubmitError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        debug!(
            request_id = %request.request_id,
            status = %status.as_u16(),
            latency_ms = %start.elapsed().as_millis(),
            "invoice_response"
        );
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(SubmitError::Rejected { status: status.as_u16(), body: truncate_body(body) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body_respects_char_boundary() {
        let body = "é".repeat(200);
        let out = truncate_body(body);
        assert!(out.len() <= MAX_ERROR_BODY);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_short_body_untouched() {
        assert_eq!(truncate_body("not found".to_string()), "not found");
    }

    #[test]
    fn test_urls_follow_base() {
        let config = Config::default();
        let client = HttpInvoiceClient::new(&config).unwrap();
        assert_eq!(client.url, "http://127.0.0.1:8000/invoices");

        let (_tx, rx) = mpsc::channel(1);
        let publisher = BackendPublisher::new(&config, rx, Arc::new(Metrics::new())).unwrap();
        assert_eq!(publisher.sessions_url, "http://127.0.0.1:8000/sessions/update");
        assert_eq!(publisher.events_url, "http://127.0.0.1:8000/events");
    }
}
