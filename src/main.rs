use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use config::Config;
use pseudolive::clock::{Clock, MonotonicClock};
use pseudolive::driver::SessionDriver;
use pseudolive::manifest::Durations;
use pseudolive::media::sim::{SimConfig, SimulatedMedia};
use pseudolive::media::Capability;
use pseudolive::presence::PresenceRegistry;
use pseudolive::session::{PlaybackSession, SyncConfig};
use pseudolive::store::{Catalog, ChatStore, MemoryChatStore, ScheduledEvent};
use pseudolive::{create_app, AppState};
use serde::Deserialize;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the events pages and API (default)
    Serve,
    /// Run one playback session against the simulated media engine
    Simulate(SimulateArgs),
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Seconds since the scheduled start; negative for an upcoming event
    #[arg(long, default_value_t = 100, allow_hyphen_values = true)]
    offset: i64,

    /// Length of the simulated asset in seconds
    #[arg(long, default_value_t = 3600.0)]
    duration: f64,

    /// Error added to successive seeks, e.g. --drift=-30,-12
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    drift: Vec<f64>,

    #[arg(long, value_enum, default_value_t = CapabilityArg::Engine)]
    capability: CapabilityArg,

    /// Stop after this many seconds even if the session is still live
    #[arg(long, default_value_t = 10)]
    run_for: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CapabilityArg {
    Engine,
    Native,
    Unsupported,
}

impl From<CapabilityArg> for Capability {
    fn from(arg: CapabilityArg) -> Self {
        match arg {
            CapabilityArg::Engine => Capability::Engine,
            CapabilityArg::Native => Capability::Native,
            CapabilityArg::Unsupported => Capability::Unsupported,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    server: ServerConfig,
    catalog: CatalogConfig,
    presence: PresenceConfig,
    sync: SyncConfig,
    probe: ProbeConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Deserialize)]
struct CatalogConfig {
    #[serde(default = "default_catalog_source")]
    source: String,
    #[serde(default = "default_true")]
    watch: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            source: default_catalog_source(),
            watch: true,
        }
    }
}

fn default_catalog_source() -> String {
    "events.json".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PresenceConfig {
    #[serde(default = "default_heartbeat_timeout")]
    heartbeat_timeout_secs: u64,
    #[serde(default = "default_reap_interval")]
    reap_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_reap_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct ProbeConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_probe_timeout")]
    timeout_secs: u64,
    /// Wait before probing an unreachable playlist again.
    #[serde(default = "default_probe_retry_after")]
    retry_after_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_probe_timeout(),
            retry_after_secs: default_probe_retry_after(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_probe_retry_after() -> u64 {
    60
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration; a missing file means defaults
    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .build()?;
    let settings: Settings = settings.try_deserialize()?;

    info!("Configuration loaded from {}: {:?}", args.config, settings);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings, args.port).await,
        Command::Simulate(sim) => simulate(settings, sim).await,
    }
}

async fn serve(settings: Settings, port: Option<u16>) -> anyhow::Result<()> {
    let source = &settings.catalog.source;
    info!("Loading event catalog from {}...", source);
    let catalog = match Catalog::load(source).await {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("Failed to load event catalog from {}: {}", source, e);
            Catalog::default()
        }
    };

    // keep the watcher alive for the lifetime of the server
    let _watcher = if settings.catalog.watch && !source.starts_with("http") {
        match catalog.watch(Path::new(source)) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Catalog hot reload disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let presence = PresenceRegistry::new(Duration::from_secs(settings.presence.heartbeat_timeout_secs));
    presence.spawn_reaper(Duration::from_secs(settings.presence.reap_interval_secs));

    let durations = Durations::new(
        settings.probe.enabled,
        Duration::from_secs(settings.probe.timeout_secs),
    )
    .with_retry_after(Duration::from_secs(settings.probe.retry_after_secs));

    let state = AppState::new(Arc::new(catalog), Arc::new(MemoryChatStore::new()), presence)
        .with_durations(durations)
        .with_sync(settings.sync);
    let app = create_app(state);

    let addr = format!("{}:{}", settings.server.host, port.unwrap_or(settings.server.port));
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn simulate(settings: Settings, args: SimulateArgs) -> anyhow::Result<()> {
    let clock = Arc::new(MonotonicClock::new());
    let event = ScheduledEvent {
        id: "simulated".to_string(),
        title: "Simulated event".to_string(),
        start: clock.now() - chrono::Duration::seconds(args.offset),
        media: "sim://asset.m3u8".to_string(),
    };
    info!(
        "Simulating event starting {} ({}s offset, {:.0}s asset, {:?})",
        event.start, args.offset, args.duration, args.capability
    );

    let (media, media_events) = SimulatedMedia::new(SimConfig {
        capability: args.capability.into(),
        duration: args.duration,
        seek_drift: args.drift,
        ..SimConfig::default()
    });
    let chat: Arc<dyn ChatStore> = Arc::new(MemoryChatStore::new());
    let presence = PresenceRegistry::new(Duration::from_secs(settings.presence.heartbeat_timeout_secs));

    let session = PlaybackSession::new(event.clone(), media, clock, &settings.sync);
    let (driver, handle) = SessionDriver::new(session, media_events, settings.sync.tick_interval());
    let driver = driver
        .with_chat(chat)
        .with_presence(presence.join(&event.id, "simulator".into()));

    let mut snapshots = handle.snapshots();
    let watcher = tokio::spawn(async move {
        let mut last = None;
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if last != Some(snapshot.phase) {
                last = Some(snapshot.phase);
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!("{}", json),
                    Err(e) => warn!("Failed to encode snapshot: {}", e),
                }
            }
        }
    });

    let mut run = tokio::spawn(driver.run());
    let last = tokio::select! {
        finished = &mut run => finished?,
        _ = tokio::time::sleep(Duration::from_secs(args.run_for)) => {
            handle.cancel();
            run.await?
        }
        _ = tokio::signal::ctrl_c() => {
            handle.cancel();
            run.await?
        }
    };
    let _ = watcher.await;
    info!("Final state: {}", serde_json::to_string_pretty(&last)?);
    info!("Presence after session: {}", presence.count(&event.id));
    Ok(())
}
