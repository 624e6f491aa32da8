use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser};
use lagoon::config::{self, DEFAULT_SIGNALING_URL, InitiatorPolicy, RoomConfig};
use lagoon::media::SampleDevices;
use lagoon::peer::RtcTransportFactory;
use lagoon::room::{RoomCoordinator, RoomSnapshot};
use lagoon::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(
    name = "lagoon",
    about = "Join a mesh video room through a signaling relay",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "LAGOON_SIGNALING_URL",
        default_value = DEFAULT_SIGNALING_URL,
        help = "Websocket URL of the signaling relay"
    )]
    signaling_url: String,

    #[arg(long, env = "LAGOON_ROOM", help = "Room to join")]
    room: String,

    #[arg(
        long,
        env = "LAGOON_ICE_SERVERS",
        value_name = "LIST",
        help = "Comma separated stun:/turn: urls; turn entries as url|username|credential"
    )]
    ice_servers: Option<String>,

    #[arg(
        long = "negotiation-timeout-ms",
        env = "LAGOON_NEGOTIATION_TIMEOUT_MS",
        help = "Drop peers still negotiating after this many milliseconds"
    )]
    negotiation_timeout_ms: Option<u64>,

    #[arg(
        long,
        env = "LAGOON_INITIATOR_POLICY",
        default_value = "newcomer",
        help = "Who sends the first offer: newcomer or incumbent"
    )]
    initiator_policy: InitiatorPolicy,

    #[arg(long, env = "LAGOON_LOCAL_ID", help = "Our id as assigned by the relay, if known")]
    local_id: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "LAGOON_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "LAGOON_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    fn room_config(&self) -> Result<RoomConfig> {
        let mut room = RoomConfig::new(&self.signaling_url, &self.room)
            .with_initiator_policy(self.initiator_policy);
        if let Some(raw) = &self.ice_servers {
            room.ice_servers = config::parse_ice_servers(raw).map_err(|reason| anyhow!(reason))?;
        }
        if let Some(ms) = self.negotiation_timeout_ms.filter(|ms| *ms > 0) {
            room = room.with_negotiation_timeout(Duration::from_millis(ms));
        }
        if let Some(id) = &self.local_id {
            room = room.with_local_id(id);
        }
        Ok(room)
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("lagoon: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let room_config = cli.room_config()?;
    let factory = RtcTransportFactory::new(&room_config.ice_servers)
        .context("failed to set up the media engine")?;
    let room_name = room_config.room.clone();
    let handle = RoomCoordinator::spawn(
        room_config,
        Arc::new(SampleDevices::new()),
        Arc::new(factory),
    );

    let local = handle.start_call().await.context("could not start call")?;
    info!(room = %room_name, stream_id = %local.id(), "joined; press ctrl-c to leave");

    let mut updates = handle.subscribe();
    let mut last = String::new();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                let summary = summarize(&snapshot);
                if summary != last {
                    info!(room = %room_name, state = %summary, "room state");
                    last = summary;
                }
            }
        }
    }

    handle.end_call().await;
    handle.shutdown().await;
    info!(room = %room_name, "left room");
    Ok(())
}

fn summarize(snapshot: &RoomSnapshot) -> String {
    let peers: Vec<String> = snapshot
        .peers
        .iter()
        .map(|peer| format!("{}:{:?}", peer.peer_id, peer.state))
        .collect();
    format!(
        "in_call={} relay={} peers=[{}]",
        snapshot.in_call,
        if snapshot.connected { "up" } else { "down" },
        peers.join(",")
    )
}
