//! Store simulator - publishes scripted shopper walks as perception frames
//!
//! Each scenario moves one synthetic track through the floor plan of the
//! default config (Table A, Table B, link zone) and publishes a frame per
//! tick to the frames topic.
//!
//! Usage:
//!   cargo run --bin store-sim                          # shop_and_pay
//!   cargo run --bin store-sim -- --scenario anonymous
//!   cargo run --bin store-sim -- --list

use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;

// ============================================================================
// Floor plan (matching the default config)
// ============================================================================

const ENTRANCE: (f64, f64) = (320.0, 460.0);
const AISLE: (f64, f64) = (320.0, 320.0);
const TABLE_A: (f64, f64) = (490.0, 290.0);
const TABLE_B: (f64, f64) = (158.0, 192.0);
const LINK_ZONE: (f64, f64) = (305.0, 120.0);
const EXIT: (f64, f64) = (320.0, 20.0);

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "store-sim")]
#[command(about = "Publishes scripted shopper walks to the gateway frames topic")]
struct Args {
    /// Scenario to run
    #[arg(short, long, default_value = "shop_and_pay")]
    scenario: String,

    /// List scenarios and exit
    #[arg(long)]
    list: bool,

    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Frames topic
    #[arg(long, default_value = "store/frames")]
    topic: String,

    /// Track id used for the synthetic shopper
    #[arg(long, default_value = "7")]
    track_id: i64,

    /// Code text shown in the link zone
    #[arg(long, default_value = "user-42")]
    code: String,

    /// Frames per second
    #[arg(long, default_value = "5")]
    fps: u32,
}

// ============================================================================
// Scenarios
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScenarioStep {
    /// Appear at a position
    Spawn((f64, f64)),
    /// Walk in a straight line over the given milliseconds
    Walk { to: (f64, f64), ms: u64 },
    /// Stand still
    Hold(u64),
    /// Stand still while the code reader sees the shopper's code
    ShowCode(u64),
    /// Disappear from the frame
    Leave,
}

#[derive(Debug, Clone)]
struct Scenario {
    name: &'static str,
    description: &'static str,
    steps: &'static [ScenarioStep],
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "shop_and_pay",
        description: "Visit Table A, identify at the link zone, leave",
        steps: &[
            ScenarioStep::Spawn(ENTRANCE),
            ScenarioStep::Walk { to: AISLE, ms: 1000 },
            ScenarioStep::Walk { to: TABLE_A, ms: 1500 },
            ScenarioStep::Hold(4000),
            ScenarioStep::Walk { to: AISLE, ms: 1500 },
            ScenarioStep::Walk { to: LINK_ZONE, ms: 2000 },
            ScenarioStep::ShowCode(1500),
            ScenarioStep::Hold(3000),
            ScenarioStep::Walk { to: EXIT, ms: 1000 },
            ScenarioStep::Leave,
        ],
    },
    Scenario {
        name: "anonymous",
        description: "Visit Table A and leave without showing a code",
        steps: &[
            ScenarioStep::Spawn(ENTRANCE),
            ScenarioStep::Walk { to: TABLE_A, ms: 2500 },
            ScenarioStep::Hold(4000),
            ScenarioStep::Walk { to: EXIT, ms: 3000 },
            ScenarioStep::Leave,
        ],
    },
    Scenario {
        name: "two_tables",
        description: "Walk straight from Table A to Table B, identify, leave",
        steps: &[
            ScenarioStep::Spawn(ENTRANCE),
            ScenarioStep::Walk { to: TABLE_A, ms: 2500 },
            ScenarioStep::Hold(3000),
            ScenarioStep::Walk { to: TABLE_B, ms: 3000 },
            ScenarioStep::Hold(3000),
            ScenarioStep::Walk { to: LINK_ZONE, ms: 2000 },
            ScenarioStep::ShowCode(1500),
            ScenarioStep::Hold(3000),
            ScenarioStep::Walk { to: EXIT, ms: 1000 },
            ScenarioStep::Leave,
        ],
    },
    Scenario {
        name: "leave_during_settle",
        description: "Leave the store right after leaving a table",
        steps: &[
            ScenarioStep::Spawn(LINK_ZONE),
            ScenarioStep::ShowCode(1000),
            ScenarioStep::Walk { to: TABLE_A, ms: 2000 },
            ScenarioStep::Hold(3000),
            ScenarioStep::Walk { to: EXIT, ms: 600 },
            ScenarioStep::Leave,
        ],
    },
];

// ============================================================================
// Publishing
// ============================================================================

struct Walker {
    client: AsyncClient,
    topic: String,
    track_id: i64,
    code: String,
    tick: Duration,
    position: Option<(f64, f64)>,
    frames: u64,
}

impl Walker {
    async fn publish(&mut self, show_code: bool) -> Result<(), rumqttc::ClientError> {
        let tracks = match self.position {
            Some((x, y)) => vec![json!({"id": self.track_id, "x": x, "y": y})],
            None => Vec::new(),
        };
        let codes = if show_code {
            vec![json!({"text": self.code, "points": []})]
        } else {
            Vec::new()
        };
        let frame = json!({
            "ts": Utc::now().timestamp_millis(),
            "tracks": tracks,
            "codes": codes,
        });
        self.frames += 1;
        self.client.publish(&self.topic, QoS::AtMostOnce, false, frame.to_string()).await
    }

    fn ticks(&self, ms: u64) -> u64 {
        (ms / self.tick.as_millis().max(1) as u64).max(1)
    }

    async fn run_step(&mut self, step: ScenarioStep) -> Result<(), rumqttc::ClientError> {
        match step {
            ScenarioStep::Spawn(p) => {
                self.position = Some(p);
                self.publish(false).await?;
                tokio::time::sleep(self.tick).await;
            }
            ScenarioStep::Walk { to, ms } => {
                let from = self.position.unwrap_or(to);
                let n = self.ticks(ms);
                for i in 1..=n {
                    let f = i as f64 / n as f64;
                    self.position = Some((from.0 + (to.0 - from.0) * f, from.1 + (to.1 - from.1) * f));
                    self.publish(false).await?;
                    tokio::time::sleep(self.tick).await;
                }
            }
            ScenarioStep::Hold(ms) | ScenarioStep::ShowCode(ms) => {
                let show = matches!(step, ScenarioStep::ShowCode(_));
                for _ in 0..self.ticks(ms) {
                    self.publish(show).await?;
                    tokio::time::sleep(self.tick).await;
                }
            }
            ScenarioStep::Leave => {
                self.position = None;
                // a few empty frames so any departure threshold is crossed
                for _ in 0..5 {
                    self.publish(false).await?;
                    tokio::time::sleep(self.tick).await;
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.list {
        for s in SCENARIOS {
            println!("{:<22} {}", s.name, s.description);
        }
        return Ok(());
    }

    let Some(scenario) = SCENARIOS.iter().find(|s| s.name == args.scenario) else {
        eprintln!("unknown scenario '{}', use --list", args.scenario);
        std::process::exit(2);
    };

    let client_id = format!("store-sim-{}", std::process::id());
    let mut opts = MqttOptions::new(client_id, &args.mqtt_host, args.mqtt_port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 100);

    // drive the event loop in the background
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => println!("connected"),
                Ok(_) => {}
                Err(e) => {
                    eprintln!("mqtt error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let tick = Duration::from_millis(1000 / u64::from(args.fps.max(1)));
    let mut walker = Walker {
        client,
        topic: args.topic.clone(),
        track_id: args.track_id,
        code: args.code.clone(),
        tick,
        position: None,
        frames: 0,
    };

    println!("running {}: {}", scenario.name, scenario.description);
    for step in scenario.steps {
        println!("  {:?}", step);
        walker.run_step(*step).await?;
    }

    // let the last publishes flush
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("done, {} frames published to {}", walker.frames, args.topic);
    Ok(())
}
