mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use rendezvous_engine::connection::{MemoryNetwork, PeerConnector, RemoteMedia, WebRtcConnector};
use rendezvous_engine::context::{ContextIdStore, ContextStoreError, FileContextIdStore};
use rendezvous_engine::network::StaticProbe;
use rendezvous_engine::relay::MemoryRelay;
use rendezvous_engine::{Engine, EngineError, EngineEvent, EngineOptions, PeerHandle};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::telemetry::{LogConfig, LogLevel};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    telemetry::init(&log_config).context("initialising logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Join(args) => join(args).await.context("join failed"),
        Command::Demo(args) => demo(args).await.context("demo failed"),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "rendezvous",
    about = "Find peers in a room through a polling relay and talk to them directly",
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "RENDEZVOUS_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "RENDEZVOUS_LOG_FILE",
        help = "Write logs to this file instead of stderr"
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

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room; stdin lines are broadcast to every connected peer
    Join(JoinArgs),
    /// Run two engines in this process and pass a message between them
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(help = "Room to join (at least 4 characters)")]
    room: String,

    #[arg(long, env = "RENDEZVOUS_CLIENT_ID", help = "Client id shown to other peers")]
    client: String,

    #[arg(
        long = "worker-url",
        env = "RENDEZVOUS_WORKER_URL",
        help = "Base URL of the HTTP relay worker"
    )]
    worker_url: Option<String>,

    #[arg(
        long = "context-file",
        value_name = "PATH",
        help = "Where to keep the context id (defaults to the user data directory)"
    )]
    context_file: Option<PathBuf>,

    #[arg(long, help = "Use a fresh context id instead of a stored one")]
    ephemeral: bool,
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[arg(long, help = "Connect the two engines with WebRTC instead of in-memory links")]
    webrtc: bool,

    #[arg(long, default_value = "hello from alice", help = "Message alice sends to bravo")]
    message: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("context store unavailable: {0}")]
    Context(#[from] ContextStoreError),
    #[error("failed to read stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("{0} never connected")]
    NoPeer(&'static str),
}

async fn join(args: JoinArgs) -> Result<(), CliError> {
    let mut options = EngineOptions::from_env()?;
    if let Some(url) = &args.worker_url {
        options = options.with_worker_url(url)?;
    }

    let mut builder = Engine::builder(args.client.clone(), args.room.clone()).options(options);
    if !args.ephemeral {
        let store = match &args.context_file {
            Some(path) => FileContextIdStore::new(path.clone()),
            None => FileContextIdStore::in_data_dir(&args.client)?,
        };
        debug!(path = %store.path().display(), "using stored context id");
        builder = builder.context_store(Arc::new(store) as Arc<dyn ContextIdStore>);
    }
    let engine = builder.build()?;
    let mut events = engine.events()?;
    engine.start()?;
    println!(
        "joined room {} as {} (session {})",
        engine.room_id(),
        engine.client_id(),
        engine.session_id()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            line = lines.next_line(), if stdin_open => {
                match line.map_err(CliError::Stdin)? {
                    Some(line) if line.trim() == "/peers" => {
                        for peer in engine.peers().values() {
                            println!("  {} ({})", peer.client_id(), peer.session_id());
                        }
                    }
                    Some(line) => {
                        let report = engine.broadcast(Bytes::from(line.into_bytes()));
                        for (session, err) in report.failed {
                            warn!(peer = %session, error = %err, "broadcast failed");
                        }
                    }
                    None => stdin_open = false,
                }
            }
        }
    }

    info!("leaving room");
    engine.destroy()?;
    if timeout(SHUTDOWN_GRACE, engine.closed()).await.is_err() {
        warn!("engine did not shut down within {SHUTDOWN_GRACE:?}");
    }
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::PeerConnect(peer) => println!("+ {} connected", describe(peer)),
        EngineEvent::PeerClose(peer) => println!("- {} left", describe(peer)),
        EngineEvent::Message(peer, data) => {
            println!("[{}] {}", peer.client_id(), String::from_utf8_lossy(data))
        }
        EngineEvent::Track(peer, track) => {
            println!("~ {} added track {}", describe(peer), RemoteMedia::id(track.as_ref()))
        }
    }
}

fn describe(peer: &PeerHandle) -> String {
    format!("{} ({})", peer.client_id(), peer.session_id())
}

async fn demo(args: DemoArgs) -> Result<(), CliError> {
    let relay = Arc::new(MemoryRelay::new());
    let network = MemoryNetwork::new();
    let connector = |webrtc: bool| -> Arc<dyn PeerConnector> {
        if webrtc {
            Arc::new(WebRtcConnector::new())
        } else {
            Arc::new(network.connector())
        }
    };
    let options = EngineOptions {
        stun_ice_servers: Vec::new(),
        ..EngineOptions::default()
    };

    let mut participants = Vec::new();
    for client in ["alice", "bravo"] {
        let engine = Engine::builder(client, "demo-room")
            .options(options.clone())
            .relay(relay.clone())
            .connector(connector(args.webrtc))
            .network_probe(Arc::new(StaticProbe::default()))
            .build()?;
        let events = engine.events()?;
        engine.start()?;
        participants.push((engine, events));
    }
    let (bravo, mut bravo_events) = participants.pop().ok_or(CliError::NoPeer("bravo"))?;
    let (alice, mut alice_events) = participants.pop().ok_or(CliError::NoPeer("alice"))?;

    let to_bravo = wait_for_connect(&mut alice_events)
        .await
        .ok_or(CliError::NoPeer("bravo"))?;
    println!("alice connected to {}", describe(&to_bravo));
    alice.send(&to_bravo, Bytes::from(args.message.into_bytes()))?;

    loop {
        match timeout(Duration::from_secs(30), bravo_events.recv()).await {
            Ok(Some(EngineEvent::Message(from, data))) => {
                println!("bravo received from {}: {}", from.client_id(), String::from_utf8_lossy(&data));
                break;
            }
            Ok(Some(event)) => print_event(&event),
            Ok(None) | Err(_) => return Err(CliError::NoPeer("alice")),
        }
    }

    alice.destroy()?;
    let _ = timeout(SHUTDOWN_GRACE, alice.closed()).await;
    while let Ok(Some(event)) = timeout(Duration::from_secs(10), bravo_events.recv()).await {
        print_event(&event);
        if matches!(event, EngineEvent::PeerClose(_)) {
            break;
        }
    }
    bravo.destroy()?;
    let _ = timeout(SHUTDOWN_GRACE, bravo.closed()).await;
    Ok(())
}

async fn wait_for_connect(events: &mut UnboundedReceiver<EngineEvent>) -> Option<PeerHandle> {
    loop {
        match timeout(Duration::from_secs(30), events.recv()).await {
            Ok(Some(EngineEvent::PeerConnect(peer))) => return Some(peer),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}
