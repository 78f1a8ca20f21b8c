//! Store gateway - cashier-less store core
//!
//! Consumes perception frames over MQTT, reconciles shelf snapshots into
//! per-shopper carts and settles each cart when the shopper leaves.
//!
//! Module structure:
//! - `domain/` - Core types (tracks, zones, carts, invoices)
//! - `io/` - External interfaces (MQTT, shelf cameras, detector, backend, Prometheus)
//! - `services/` - Business logic (Tracker, baselines, ledger, settlement)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use store_gateway::infra::{Config, Metrics};
use store_gateway::io::{
    create_egress_channel, BackendPublisher, HttpDetector, HttpInvoiceClient, HttpShelfCamera,
};
use store_gateway::services::{create_invoice_worker, ShelfScanner, Tracker};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Store gateway - zone tracking, cart reconciliation and settlement
#[derive(Parser, Debug)]
#[command(name = "store-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-frame visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "store-gateway starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    if let Err(e) = store_gateway::infra::broker::start_embedded_broker(&config) {
        warn!(error = %e, "broker_start_failed");
    }

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        frames_topic = %config.mqtt_frames_topic(),
        shelf_zones = %config.shelf_zones().len(),
        link_zone = ?config.link_zone(),
        settle_delay_ms = %config.settle_delay().as_millis(),
        reentry = ?config.reentry_mode(),
        backend = %config.backend_base_url(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Tracker input: frames, control, and results of its own background work
    let (event_tx, event_rx) = mpsc::channel(1000);

    // Backend egress (sessions + events)
    let (egress, egress_rx) = create_egress_channel(config.egress_queue_size(), metrics.clone());
    let publisher = BackendPublisher::new(&config, egress_rx, metrics.clone())?;
    tokio::spawn(publisher.run(shutdown_rx.clone()));

    // Invoice worker
    let invoice_backend = Arc::new(HttpInvoiceClient::new(&config)?);
    let (invoice_tx, invoice_worker) = create_invoice_worker(
        invoice_backend,
        event_tx.downgrade(),
        metrics.clone(),
        config.invoice_timeout(),
        config.invoice_queue_size(),
    );
    tokio::spawn(invoice_worker.run());

    // Shelf cameras + detector
    let scanner = Arc::new(ShelfScanner::new(
        Arc::new(HttpShelfCamera::new(&config)?),
        Arc::new(HttpDetector::new(&config)?),
    ));

    // MQTT ingress
    let weak_events = event_tx.downgrade();
    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            store_gateway::io::mqtt::start_mqtt_client(&mqtt_config, event_tx, mqtt_metrics, mqtt_shutdown)
                .await
        {
            error!(error = %e, "mqtt_client_error");
        }
    });

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = store_gateway::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics summary
    let report_metrics = metrics.clone();
    let report_interval = Duration::from_secs(config.metrics_interval_secs().max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(report_interval);
        loop {
            interval.tick().await;
            report_metrics.report().log();
        }
    });

    let mut tracker = Tracker::new(config, scanner, invoice_tx, egress, metrics, weak_events);

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    tracker.run(event_rx, shutdown_rx).await;

    info!("store-gateway shutdown complete");
    Ok(())
}
