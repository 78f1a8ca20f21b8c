//! Embedded MQTT broker using rumqttd
//!
//! Lets a single box run perception, broker and gateway without an external
//! mosquitto. Disabled with `[broker] enabled = false`.

use crate::infra::config::Config as AppConfig;
use anyhow::Context;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Perception frames carry a handful of tracks; 256 KiB is plenty
const MAX_PAYLOAD_SIZE: usize = 262_144;

fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 104_857_600,
        max_segment_count: 10,
        max_connections: 64,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker on its own thread if enabled
///
/// Returns once the listener had a moment to bind; `broker.start()` blocks
/// for the life of the process.
pub fn start_embedded_broker(app_config: &AppConfig) -> anyhow::Result<bool> {
    if !app_config.broker_enabled() {
        info!("broker_disabled");
        return Ok(false);
    }

    let addr = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen: SocketAddr =
        addr.parse().with_context(|| format!("Invalid broker bind address {addr}"))?;

    let config = broker_config(listen);
    thread::Builder::new()
        .name("mqtt-broker".to_string())
        .spawn(move || {
            let mut broker = Broker::new(config);
            if let Err(e) = broker.start() {
                warn!(error = %e, "broker_start_failed");
            }
        })
        .context("Failed to spawn broker thread")?;

    thread::sleep(Duration::from_millis(100));
    info!(listen = %listen, "broker_started");
    Ok(true)
}
