use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canrelay::config::NodeConfig;
use canrelay::session::session::SessionState;
use canrelay::session::telemetry::TelemetryRecord;
use canrelay::transport::event_loop::Node;
use canrelay::transport::multicast::MulticastDataPlaneFactory;
use clap::Parser;
use clap_derive::Parser;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    broker_address: String,
    control_address: String,

    #[clap(long, default_value = "relay-node")]
    name: String,

    #[clap(long)]
    device: Vec<String>,

    #[clap(long, default_value_t = 1)]
    max_retransmissions: u8,

    #[clap(long, default_value_t = 20.0)]
    frame_rate: f64,

    /// send a synthetic sensor frame per frame period while this node is the session's reference
    #[clap(long, default_value_t = false)]
    simulate: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let broker_addr: SocketAddr = args.broker_address.parse()?;
    let control_addr: SocketAddr = args.control_address.parse()?;

    let mut config = NodeConfig::new(&args.name, broker_addr, control_addr);
    config.devices = args.device;
    config.max_retransmissions = args.max_retransmissions;
    config.frame_rate = args.frame_rate;
    config.validate()?;
    let frame_period = Duration::from_secs_f64(1.0 / config.frame_rate);

    let shutdown = CancellationToken::new();
    let factory = Arc::new(MulticastDataPlaneFactory::new(Arc::new(config.clone())));
    let (node, mut telemetry) = Node::new(config, factory, shutdown.clone())?;

    tokio::spawn(async move {
        while let Some(record) = telemetry.recv().await {
            match record {
                TelemetryRecord::CanMsg(data) => info!("CAN from #{} in frame {}: {:?}", data.member_index, data.frame_number, data.message.frame),
                other => info!("{:?}", other),
            }
        }
    });

    if args.simulate {
        let session = node.session().clone();
        tokio::spawn(async move {
            let mut ticks = time::interval(frame_period);
            let mut signal = 0.0f32;
            loop {
                ticks.tick().await;
                let mut session = session.lock().await;
                if session.state() != SessionState::Active || !session.roster().is_some_and(|r| r.is_reference()) {
                    continue;
                }
                signal += 0.1;
                if let Err(e) = session.send_sensor(vec![signal, signal.sin()]).await {
                    warn!("cannot send sensor frame: {}", e);
                }
            }
        });
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    node.run().await
}
