//! MQTT ingress for perception frames and operator control messages

use crate::domain::types::{epoch_ms, ControlCommand, PerceptionFrame, TrackerEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Which subscription a publish arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngressTopic {
    Frames,
    Control,
}

/// Topic routing resolved once from config
struct Topics {
    frames: String,
    control: String,
}

impl Topics {
    fn classify(&self, topic: &str) -> Option<IngressTopic> {
        if topic == self.frames {
            Some(IngressTopic::Frames)
        } else if topic == self.control {
            Some(IngressTopic::Control)
        } else {
            None
        }
    }
}

/// Decode one MQTT payload into a tracker event
fn parse_payload(
    kind: IngressTopic,
    payload: &[u8],
    received_at: Instant,
) -> Result<TrackerEvent, serde_json::Error> {
    match kind {
        IngressTopic::Frames => {
            let frame: PerceptionFrame = serde_json::from_slice(payload)?;
            Ok(TrackerEvent::Frame { frame, received_at })
        }
        IngressTopic::Control => {
            let cmd: ControlCommand = serde_json::from_slice(payload)?;
            Ok(TrackerEvent::Control(cmd))
        }
    }
}

/// Start the MQTT client and forward decoded frames to the tracker
///
/// Events are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped events are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_client(
    config: &Config,
    event_tx: mpsc::Sender<TrackerEvent>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_id = format!("store-gateway-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_max_packet_size(256 * 1024, 256 * 1024);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let topics = Topics {
        frames: config.mqtt_frames_topic().to_string(),
        control: config.mqtt_control_topic().to_string(),
    };

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(&topics.frames, QoS::AtMostOnce).await?;
    // control messages are rare and must not be lost
    client.subscribe(&topics.control, QoS::AtLeastOnce).await?;

    info!(
        frames = %topics.frames,
        control = %topics.control,
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_subscribed"
    );

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_at = Instant::now();
                        let Some(kind) = topics.classify(&publish.topic) else {
                            debug!(topic = %publish.topic, "mqtt_unrouted_topic");
                            continue;
                        };

                        let event = match parse_payload(kind, &publish.payload, received_at) {
                            Ok(event) => event,
                            Err(e) => {
                                metrics.record_ingress_malformed();
                                warn!(topic = %publish.topic, error = %e, "mqtt_payload_invalid");
                                continue;
                            }
                        };

                        if let TrackerEvent::Frame { frame, .. } = &event {
                            if frame.ts > 0 {
                                debug!(
                                    tracks = %frame.tracks.len(),
                                    codes = %frame.codes.len(),
                                    lag_ms = %epoch_ms().saturating_sub(frame.ts),
                                    "frame_received"
                                );
                            }
                        }

                        if let Err(e) = event_tx.try_send(event) {
                            match e {
                                TrySendError::Full(_) => {
                                    metrics.record_ingress_dropped();
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!("mqtt_frame_dropped: channel full");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                TrySendError::Closed(_) => {
                                    warn!("tracker_channel_closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TrackId;

    fn topics() -> Topics {
        Topics { frames: "store/frames".to_string(), control: "store/control".to_string() }
    }

    #[test]
    fn test_classify_topics() {
        let t = topics();
        assert_eq!(t.classify("store/frames"), Some(IngressTopic::Frames));
        assert_eq!(t.classify("store/control"), Some(IngressTopic::Control));
        assert_eq!(t.classify("store/other"), None);
    }

    #[test]
    fn test_parse_frame_payload() {
        let payload = br#"{"ts": 1767617600000,
            "tracks": [{"id": 7, "x": 480.0, "y": 300.0}, {"id": 8, "x": 10.0, "y": 10.0}],
            "codes": []}"#;
        let event = parse_payload(IngressTopic::Frames, payload, Instant::now()).unwrap();
        let TrackerEvent::Frame { frame, .. } = event else {
            panic!("expected frame");
        };
        assert_eq!(frame.tracks.len(), 2);
        assert_eq!(frame.tracks[1].track_id(), TrackId(8));
    }

    #[test]
    fn test_parse_control_payload() {
        let event =
            parse_payload(IngressTopic::Control, br#"{"select": 7}"#, Instant::now()).unwrap();
        assert!(matches!(
            event,
            TrackerEvent::Control(ControlCommand::Select { select: Some(7) })
        ));
    }

    #[test]
    fn test_parse_invalid_payload() {
        assert!(parse_payload(IngressTopic::Frames, b"not json", Instant::now()).is_err());
        assert!(parse_payload(IngressTopic::Frames, br#"{"tracks": [{"id": "x"}]}"#, Instant::now())
            .is_err());
    }
}
