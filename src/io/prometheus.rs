//! Prometheus metrics HTTP endpoint
//!
//! Exposes gateway metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSnapshot, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let snapshot = metrics.snapshot();
    let mut output = String::with_capacity(8192);

    write_frame_metrics(&mut output, site_id, &snapshot);
    write_zone_metrics(&mut output, site_id, &snapshot);
    write_cart_metrics(&mut output, site_id, &snapshot);
    write_settlement_metrics(&mut output, site_id, &snapshot);
    write_io_metrics(&mut output, site_id, &snapshot);

    output
}

fn write_frame_metrics(output: &mut String, site: &str, s: &MetricsSnapshot) {
    write_metric(
        output,
        "store_frames_total",
        "Perception frames processed",
        MetricType::Counter,
        site,
        s.frames_total,
    );
    write_histogram(
        output,
        "store_frame_latency_us",
        "Frame processing latency in microseconds",
        site,
        &s.frame_latency_buckets,
        s.frame_latency_avg_us,
    );
    write_metric(
        output,
        "store_frame_latency_p99_us",
        "99th percentile frame latency",
        MetricType::Gauge,
        site,
        s.frame_latency_p99_us,
    );
    write_metric(
        output,
        "store_active_tracks",
        "Tracks currently present",
        MetricType::Gauge,
        site,
        s.active_tracks,
    );
}

fn write_zone_metrics(output: &mut String, site: &str, s: &MetricsSnapshot) {
    write_metric(
        output,
        "store_zone_enters_total",
        "Zone enter transitions",
        MetricType::Counter,
        site,
        s.zone_enters,
    );
    write_metric(
        output,
        "store_zone_exits_total",
        "Zone exit transitions",
        MetricType::Counter,
        site,
        s.zone_exits,
    );
    write_metric(
        output,
        "store_baselines_captured_total",
        "Shelf baselines captured on enter",
        MetricType::Counter,
        site,
        s.baselines_captured,
    );
    write_metric(
        output,
        "store_detections_unavailable_total",
        "Shelf snapshots or detections that could not be obtained",
        MetricType::Counter,
        site,
        s.detections_unavailable,
    );
    write_metric(
        output,
        "store_diffs_applied_total",
        "Exit diffs applied to a cart",
        MetricType::Counter,
        site,
        s.diffs_applied,
    );
    write_metric(
        output,
        "store_diffs_skipped_total",
        "Exit diffs skipped (no baseline or no detection)",
        MetricType::Counter,
        site,
        s.diffs_skipped,
    );
    write_metric(
        output,
        "store_diffs_superseded_total",
        "Exit diffs discarded for a newer generation",
        MetricType::Counter,
        site,
        s.diffs_superseded,
    );
    write_metric(
        output,
        "store_pending_diffs",
        "Exit diffs waiting to fire",
        MetricType::Gauge,
        site,
        s.pending_diffs,
    );
}

fn write_cart_metrics(output: &mut String, site: &str, s: &MetricsSnapshot) {
    write_metric(
        output,
        "store_items_taken_total",
        "Items added to carts",
        MetricType::Counter,
        site,
        s.items_taken,
    );
    write_metric(
        output,
        "store_items_returned_total",
        "Items returned to shelves",
        MetricType::Counter,
        site,
        s.items_returned,
    );
    write_metric(
        output,
        "store_malformed_mutations_total",
        "Cart mutations rejected before the ledger",
        MetricType::Counter,
        site,
        s.malformed_mutations,
    );
    write_metric(
        output,
        "store_identity_links_total",
        "Track to identity links",
        MetricType::Counter,
        site,
        s.identity_links,
    );
}

fn write_settlement_metrics(output: &mut String, site: &str, s: &MetricsSnapshot) {
    write_metric(
        output,
        "store_settlements_paid_total",
        "Departures settled as paid",
        MetricType::Counter,
        site,
        s.settlements_paid,
    );
    write_metric(
        output,
        "store_settlements_unpaid_total",
        "Departures settled as unpaid",
        MetricType::Counter,
        site,
        s.settlements_unpaid,
    );
    write_metric(
        output,
        "store_invoice_failures_total",
        "Invoice submissions that failed",
        MetricType::Counter,
        site,
        s.invoice_failures,
    );
    write_histogram(
        output,
        "store_invoice_latency_ms",
        "Invoice round-trip latency in milliseconds",
        site,
        &s.invoice_latency_buckets,
        s.invoice_latency_avg_ms,
    );
    write_histogram(
        output,
        "store_invoice_queue_delay_us",
        "Invoice queue delay in microseconds",
        site,
        &s.invoice_queue_delay_buckets,
        s.invoice_queue_delay_avg_us,
    );
    write_metric(
        output,
        "store_invoice_queue_delay_max_us",
        "Maximum invoice queue delay",
        MetricType::Gauge,
        site,
        s.invoice_queue_delay_max_us,
    );
}

fn write_io_metrics(output: &mut String, site: &str, s: &MetricsSnapshot) {
    write_metric(
        output,
        "store_ingress_dropped_total",
        "Ingress messages dropped because the tracker queue was full",
        MetricType::Counter,
        site,
        s.ingress_dropped,
    );
    write_metric(
        output,
        "store_ingress_malformed_total",
        "Ingress payloads that failed to parse",
        MetricType::Counter,
        site,
        s.ingress_malformed,
    );
    write_metric(
        output,
        "store_egress_dropped_total",
        "Session/event messages dropped because the egress queue was full",
        MetricType::Counter,
        site,
        s.egress_dropped,
    );
    write_metric(
        output,
        "store_egress_failed_total",
        "Backend deliveries that failed",
        MetricType::Counter,
        site,
        s.egress_failed,
    );
    write_metric(
        output,
        "store_event_queue_depth",
        "Current tracker queue depth",
        MetricType::Gauge,
        site,
        s.event_queue_depth,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        resp.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    resp
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let resp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => {
            text_response(StatusCode::OK, "text/plain", "ok".to_string())
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(resp)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle_request(req, metrics.clone(), site_id.clone())
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_frame_processed(150);
        metrics.record_frame_processed(250);
        metrics.record_settlement(true);
        metrics.record_items_taken(2);
        metrics.set_active_tracks(3);

        let output = format_prometheus_metrics(&metrics, "store-1");

        assert!(output.contains("store_frames_total{site=\"store-1\"} 2"));
        assert!(output.contains("store_frame_latency_us_bucket{site=\"store-1\",le=\"200\"} 1"));
        assert!(output.contains("store_frame_latency_us_bucket{site=\"store-1\",le=\"+Inf\"} 2"));
        assert!(output.contains("store_settlements_paid_total{site=\"store-1\"} 1"));
        assert!(output.contains("store_items_taken_total{site=\"store-1\"} 2"));
        assert!(output.contains("store_active_tracks{site=\"store-1\"} 3"));
    }

    #[test]
    fn test_scrape_does_not_reset_counters() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(100);

        let first = format_prometheus_metrics(&metrics, "s");
        let second = format_prometheus_metrics(&metrics, "s");
        assert!(first.contains("store_frames_total{site=\"s\"} 1"));
        assert!(second.contains("store_frames_total{site=\"s\"} 1"));
        assert!(second.contains("store_frame_latency_us_count{site=\"s\"} 1"));
    }
}
