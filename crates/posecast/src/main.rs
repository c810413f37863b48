#![forbid(unsafe_code)]

use posecast::broker::WsBroker;
use posecast::capture::NoCapture;
use posecast::cascade::{CascadeSettings, FallbackCascade, SourceTier};
use posecast::config::{load_config, resolve_data_path, AppConfig, Cli, Commands, ConfigAction};
use posecast::estimator::{EncodedLandmarks, PoseEstimator};
use posecast::forward::RelayForwarder;
use posecast::local_api::{self, ApiContext};
use posecast::peer::{PeerAcquisition, PeerSettings};
use posecast::relay::{LinkSettings, RelayLink, WsConnector};
use posecast::store::{patch_from_pair, ConfigError, ConfigStore, FileStore};
use posecast_common::{RelayMessage, SystemCommand};

use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

// ── Shared helpers ──────────────────────────────────────────────────

fn daemon_addr(listen: Option<&str>) -> &str {
    let listen = listen.unwrap_or("tcp://127.0.0.1:7710");
    listen.strip_prefix("tcp://").unwrap_or(listen)
}

fn store_path(cli: &Cli, app: Option<&AppConfig>) -> PathBuf {
    if let Some(path) = &cli.store {
        return path.clone();
    }
    match app {
        Some(app) if !app.store.is_empty() => PathBuf::from(&app.store),
        _ => resolve_data_path("store.json"),
    }
}

fn open_store(cli: &Cli, app: Option<&AppConfig>) -> anyhow::Result<ConfigStore<FileStore>> {
    let path = store_path(cli, app);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(ConfigStore::new(FileStore::open(path)?))
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

fn log_inbound(msg: &RelayMessage) {
    match msg {
        RelayMessage::AiFeedback { payload, .. } => {
            info!(feedback = %payload.feedback, "coach feedback");
        }
        RelayMessage::PerformanceMetrics { payload, .. } => debug!(
            heart_rate = payload.heart_rate,
            reps = payload.rep_count,
            duration_s = payload.workout_duration,
            "performance metrics"
        ),
        RelayMessage::SystemCommand { payload, .. } => match payload {
            SystemCommand::StartWorkout => info!("relay started workout"),
            SystemCommand::StopWorkout => info!("relay stopped workout"),
            SystemCommand::Unrecognized => debug!("ignoring unrecognized system command"),
            SystemCommand::SelectExercise { .. } => {}
        },
        other => debug!(kind = ?other.kind(), "ignoring outbound-only message from relay"),
    }
}

// ── Daemon ──────────────────────────────────────────────────────────

async fn run_daemon(cli: &Cli) -> anyhow::Result<()> {
    let mut app = load_config(cli.config.as_deref())?;

    if let Some(ref listen) = cli.listen {
        app.listen = listen.clone();
    }

    app.validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let store = open_store(cli, Some(&app))?;
    let connection = store.load();
    let validation = connection.validate();
    if !validation.valid {
        warn!(
            errors = ?validation.errors,
            "stored relay settings are invalid; fix with `posecast config set`"
        );
    }

    let endpoint = connection.effective_endpoint().to_string();

    // Startup banner
    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ posecast{RESET} {DIM}v{v}{RESET}");
        if endpoint.is_empty() {
            eprintln!("  {DIM}Relay{RESET}      {YELLOW}auto-discover{RESET}");
        } else {
            eprintln!("  {DIM}Relay{RESET}      {endpoint}");
        }
        eprintln!("  {DIM}Listen{RESET}     {}", app.listen);
        if app.signaling.enabled {
            eprintln!("  {DIM}Signaling{RESET}  {}", app.signaling.url);
        }
        eprintln!();
    }

    let sample_interval = Duration::from_millis(connection.sample_interval_ms);
    let relay = RelayLink::spawn(connection, LinkSettings::from(&app), WsConnector);
    info!(device_id = relay.device_id(), "starting posecast daemon");
    let _inbound = relay.subscribe(log_inbound);

    let (samples_tx, _) = broadcast::channel(256);
    let forwarder =
        RelayForwarder::new(relay.clone(), sample_interval).with_tap(samples_tx.clone());
    let cascade = FallbackCascade::spawn(CascadeSettings::from(&app), forwarder, NoCapture);

    let peer = if app.signaling.enabled {
        let broker = WsBroker::new(
            WsConnector,
            app.signaling.url.clone(),
            app.signaling.key.clone(),
            Duration::from_millis(app.signaling.heartbeat_ms),
        );
        let estimators = || -> Box<dyn PoseEstimator> { Box::new(EncodedLandmarks) };
        Some(PeerAcquisition::spawn(
            PeerSettings::from(&app),
            broker,
            estimators,
            cascade.sender(),
        ))
    } else {
        info!("peer acquisition disabled");
        cascade.report_unavailable(SourceTier::PeerLive);
        None
    };

    relay.connect().await?;

    let api_handle = tokio::spawn({
        let listen = app.listen.clone();
        let ctx = ApiContext {
            relay: relay.clone(),
            peer: peer.clone(),
            cascade: cascade.status(),
            samples: samples_tx,
        };
        async move {
            if let Err(e) = local_api::start_local_api(&listen, ctx).await {
                error!("Local API error: {}", e);
            }
        }
    });

    tokio::select! {
        _ = api_handle => {
            info!("Local API server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    if let Some(peer) = peer {
        peer.close().await;
    }
    cascade.shutdown().await;
    if let Err(e) = relay.disconnect().await {
        debug!(error = %e, "relay link already stopped");
    }

    Ok(())
}

// ── Daemon IPC ──────────────────────────────────────────────────────

async fn daemon_cmd(listen: &str, cmd: &str) -> anyhow::Result<String> {
    match TcpStream::connect(listen).await {
        Ok(stream) => {
            let (reader, mut writer) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(reader);

            writer.write_all(cmd.as_bytes()).await?;
            writer.write_all(b"\n").await?;

            let mut line = String::new();
            reader.read_line(&mut line).await?;

            Ok(line)
        }
        Err(e) => {
            if tty() {
                eprintln!();
                eprintln!("  {RED}✗{RESET} Could not connect to daemon");
                eprintln!("    {DIM}{e}{RESET}");
                eprintln!();
                eprintln!("    Is posecast running? Try: {BOLD}posecast start{RESET}");
                eprintln!();
            } else {
                eprintln!("Failed to connect to daemon: {e}");
            }
            std::process::exit(1);
        }
    }
}

// ── Pretty formatters ───────────────────────────────────────────────

fn fmt_status(json: &serde_json::Value) {
    let link = &json["link"];
    let state = link["state"].as_str().unwrap_or("unknown");
    let dot = match state {
        "connected" => format!("{GREEN}●{RESET}"),
        "connecting" | "reconnecting" => format!("{YELLOW}●{RESET}"),
        _ => format!("{RED}●{RESET}"),
    };
    let text = link["text"].as_str().unwrap_or(state);

    let v = env!("CARGO_PKG_VERSION");
    println!();
    println!("  {BOLD}◈ posecast{RESET} {DIM}v{v}{RESET}");
    println!();
    println!("  {DIM}Relay{RESET}      {dot} {text}");
    if let Some(endpoint) = link["endpoint"].as_str() {
        println!("  {DIM}Endpoint{RESET}   {endpoint}");
    }
    if let Some(reason) = link["failure"].as_str() {
        println!("  {DIM}Failure{RESET}    {RED}{reason}{RESET}");
    }
    if let Some(device) = link["device_id"].as_str() {
        println!("  {DIM}Device{RESET}     {CYAN}{device}{RESET}");
    }
    if let Some(exercise) = link["exercise"].as_str() {
        println!("  {DIM}Exercise{RESET}   {exercise}");
    }

    match json["peer"].as_object() {
        Some(peer) => {
            let state = peer.get("state").and_then(|s| s.as_str()).unwrap_or("unknown");
            println!("  {DIM}Peer{RESET}       {state}");
            if let Some(id) = peer.get("session_id").and_then(|s| s.as_str()) {
                println!("  {DIM}Pair with{RESET}  {CYAN}{id}{RESET}");
            }
        }
        None => println!("  {DIM}Peer{RESET}       {DIM}disabled{RESET}"),
    }

    if let Some(source) = json["source"]["active"].as_str() {
        println!("  {DIM}Source{RESET}     {source}");
    }
    println!();
}

fn fail(message: &str, json: serde_json::Value) -> anyhow::Result<()> {
    if tty() {
        println!("  {RED}✗{RESET} {message}");
    } else {
        println!("{}", serde_json::to_string(&json)?);
    }
    std::process::exit(1);
}

fn run_config(cli: &Cli, action: &ConfigAction) -> anyhow::Result<()> {
    let app = load_config(cli.config.as_deref()).ok();
    let store = open_store(cli, app.as_ref())?;

    match action {
        ConfigAction::Show => {
            let config = store.load();
            let mut json = serde_json::to_value(&config)?;
            if let Some(obj) = json.as_object_mut() {
                obj.insert(
                    "effectiveEndpoint".to_string(),
                    config.effective_endpoint().into(),
                );
            }
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        ConfigAction::Set { key, value } => match store.update(patch_from_pair(key, value)) {
            Ok(config) => {
                if tty() {
                    println!("  {GREEN}✓{RESET} Saved {BOLD}{key}{RESET}");
                } else {
                    println!("{}", serde_json::to_string(&config)?);
                }
            }
            Err(ConfigError::Invalid(errors)) => {
                if tty() {
                    for e in &errors {
                        println!("  {RED}✗{RESET} {e}");
                    }
                    std::process::exit(1);
                }
                fail(
                    "invalid configuration",
                    serde_json::json!({"valid": false, "errors": errors}),
                )?;
            }
            Err(e) => fail(&e.to_string(), serde_json::json!({"error": e.to_string()}))?,
        },
        ConfigAction::Reset => {
            store.reset()?;
            if tty() {
                println!("  {GREEN}✓{RESET} Relay settings reset to defaults");
            } else {
                println!(r#"{{"status":"reset"}}"#);
            }
        }
        ConfigAction::Validate => {
            let validation = store.validate();
            if tty() {
                if validation.valid {
                    println!("  {GREEN}✓{RESET} Relay settings valid");
                } else {
                    for e in &validation.errors {
                        println!("  {RED}✗{RESET} {e}");
                    }
                }
            } else {
                println!("{}", serde_json::to_string(&validation)?);
            }
            if !validation.valid {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!(
            "Failed to install rustls crypto provider - may already be installed or unsupported platform"
        );
    }

    let cli = Cli::parse();

    init_tracing(&cli)?;

    match &cli.command {
        Commands::Start => run_daemon(&cli).await?,

        Commands::Status => {
            let addr = daemon_addr(cli.listen.as_deref());
            let resp = daemon_cmd(addr, r#"{"cmd": "status"}"#).await?;

            if tty() {
                let json: serde_json::Value = serde_json::from_str(resp.trim())?;
                fmt_status(&json);
            } else {
                print!("{resp}");
            }
        }

        Commands::Config { action } => run_config(&cli, action)?,
    }

    Ok(())
}
