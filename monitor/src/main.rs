use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use monitor::collaborators::{PublicAddressResolver, ServerStore};
use monitor::config::MonitorConfig;
use monitor::events::{EventBus, Notification};
use monitor::fleet::{FleetMonitor, SweepOutcome};
use monitor::gateway::QueryGateway;
use monitor::model::{GameServer, InfoField};
use monitor::providers::{ConfigCatalog, HttpIpLookup, StaticIp, SteamVersionOracle};
use monitor::relay::LogRelay;
use monitor::session::SourceSessionFactory;
use monitor::store::MemoryStore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};

/// Game server fleet monitor
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[clap(short, long, env = "FLEET_MONITOR_CONFIG", default_value = "monitor.toml")]
    config: PathBuf,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitor until Ctrl+C (default)
    Run,
    /// Probe one server once and print what it reports
    Status { address: SocketAddr },
    /// Run a console command on a configured server
    Rcon {
        address: SocketAddr,
        #[clap(required = true)]
        command: Vec<String>,
    },
    /// Restart a configured server through the restart command template
    Restart { address: SocketAddr },
    /// Stop a configured server through the stop command template
    Stop { address: SocketAddr },
}

/// Everything the subcommands need, wired once from the config
struct App {
    config: MonitorConfig,
    gateway: Arc<QueryGateway>,
    store: Arc<dyn ServerStore>,
    monitor: Arc<FleetMonitor>,
    relay: Option<Arc<LogRelay>>,
    events: EventBus,
}

impl App {
    async fn build(path: &Path, config: MonitorConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(ConfigCatalog::new(path, config.commands.clone()));
        let gateway = Arc::new(QueryGateway::new(
            Arc::new(SourceSessionFactory),
            catalog.clone(),
            config.query.retry_policy(),
        ));

        let seeds = config.seed_servers();
        let store: Arc<dyn ServerStore> = match &config.store.path {
            Some(snapshot) => Arc::new(MemoryStore::load(snapshot, seeds).await?),
            None => Arc::new(MemoryStore::new(seeds)),
        };

        let oracle = Arc::new(SteamVersionOracle::new(
            config.version.check_url.clone(),
            config.version.app_id,
        )?);
        let events = EventBus::default();

        let monitor = Arc::new(FleetMonitor::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            catalog,
            oracle,
            events.clone(),
            config.monitor.clone(),
        ));

        let relay = if config.relay.listen_port().is_some() {
            let resolver: Arc<dyn PublicAddressResolver> = match config.relay.public_ip {
                Some(ip) => Arc::new(StaticIp(ip)),
                None => Arc::new(HttpIpLookup::new(config.relay.ip_lookup_url.clone())?),
            };
            Some(Arc::new(LogRelay::new(
                config.relay.clone(),
                Arc::clone(&gateway),
                Arc::clone(&store),
                resolver,
                events.clone(),
            )))
        } else {
            info!("No relay port configured, log relay disabled");
            None
        };

        Ok(Self {
            config,
            gateway,
            store,
            monitor,
            relay,
            events,
        })
    }
}

/// Main-method of the application.
/// Loads the config, wires the monitor, then dispatches to the chosen subcommand.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = MonitorConfig::load(&args.config).await?;
    let app = App::build(&args.config, config).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(app).await,
        Command::Status { address } => status(&app, address).await,
        Command::Rcon { address, command } => rcon(&app, address, &command.join(" ")).await,
        Command::Restart { address } => app.monitor.restart_server(address).await,
        Command::Stop { address } => app.monitor.stop_server(address).await,
    }
}

/// Runs the sweep and status loops until Ctrl+C, then detaches the log relay.
async fn run(app: App) -> anyhow::Result<()> {
    spawn_notification_logger(&app.events);

    if let Some(relay) = &app.relay {
        attach_logs(&app, relay).await;
    }

    let sweep_handle = {
        let monitor = Arc::clone(&app.monitor);
        let period = app.config.monitor.sweep_interval();
        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                match monitor.update_game_servers().await {
                    SweepOutcome::Swept {
                        target,
                        eligible,
                        completed,
                    } => info!(
                        "Sweep done: target {}, {} eligible, completed: {}",
                        target, eligible, completed
                    ),
                    outcome => warn!("Sweep ended early: {:?}", outcome),
                }
            }
        })
    };

    let status_handle = {
        let monitor = Arc::clone(&app.monitor);
        let period = app.config.monitor.status_interval();
        let max_age = app.config.monitor.status_max_age();
        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // The first sweep refreshes everything anyway
            timer.tick().await;

            loop {
                timer.tick().await;
                let refreshed = monitor.refresh_stale_statuses(max_age).await;
                if refreshed > 0 {
                    info!("Refreshed {} stale server statuses", refreshed);
                }
            }
        })
    };

    tokio::select! {
        result = sweep_handle => {
            if let Err(e) = result {
                error!("Sweep task panicked: {}", e);
            }
        }
        result = status_handle => {
            if let Err(e) = result {
                error!("Status task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    if let Some(relay) = &app.relay {
        detach_logs(&app, relay).await;
    }
    Ok(())
}

fn spawn_notification_logger(events: &EventBus) {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(notification @ Notification::LogLine(_)) => {
                    info!(target: "gamelog", "{}", notification)
                }
                Ok(notification @ Notification::UpdateDelayed { .. }) => {
                    warn!("{}", notification)
                }
                Ok(notification) => info!("{}", notification),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Notification logger fell behind, {} skipped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn log_enabled_servers(app: &App) -> Vec<GameServer> {
    match app.store.find_all().await {
        Ok(servers) => servers.into_iter().filter(|s| s.log_enabled).collect(),
        Err(e) => {
            error!("Could not list servers: {:#}", e);
            Vec::new()
        }
    }
}

async fn attach_logs(app: &App, relay: &LogRelay) {
    for mut server in log_enabled_servers(app).await {
        match relay.start(&mut server).await {
            Ok(()) => {
                if let Err(e) = app.store.save(&server).await {
                    warn!("Could not save {}: {:#}", server, e);
                }
            }
            Err(e) => warn!("Could not attach log relay to {}: {}", server, e),
        }
    }
}

async fn detach_logs(app: &App, relay: &LogRelay) {
    for mut server in log_enabled_servers(app).await {
        if let Err(e) = relay.stop(&mut server).await {
            warn!("Could not detach log relay from {}: {}", server, e);
        }
    }
}

async fn status(app: &App, address: SocketAddr) -> anyhow::Result<()> {
    let ping = app.gateway.ping(address).await;
    let players = app.gateway.players(address).await;
    let info = app.gateway.info(address).await;

    println!("{}", address);
    println!("  ping:    {}", ping);
    println!("  players: {}", players);
    for (label, field) in [
        ("name", InfoField::Name),
        ("map", InfoField::Map),
        ("version", InfoField::Version),
        ("max", InfoField::MaxPlayers),
        ("tv port", InfoField::TvPort),
    ] {
        if let Some(value) = info.get(&field) {
            println!("  {:<8} {}", format!("{}:", label), value);
        }
    }
    Ok(())
}

async fn rcon(app: &App, address: SocketAddr, command: &str) -> anyhow::Result<()> {
    let mut server = app
        .store
        .find_by_address(address)
        .await?
        .ok_or_else(|| anyhow!("{} is not a configured server", address))?;

    let output = app
        .gateway
        .rcon_refreshing(&mut server, command)
        .await
        .with_context(|| format!("running {:?} on {}", command, server))?;
    app.store.save(&server).await?;

    println!("{}", output.trim_end());
    Ok(())
}
