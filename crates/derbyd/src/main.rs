use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use derbyd::config::LogLevel;
use derbyd::fleet::client::DeviceClient;
use derbyd::fleet::client::HttpDeviceClient;
use derbyd::fleet::discovery::Discovery;
use derbyd::fleet::dispatcher::Dispatcher;
use derbyd::fleet::health::HealthMonitor;
use derbyd::fleet::registry::Registry;
use derbyd::show::controller::CommandSink;
use derbyd::show::controller::PhaseController;
use derbyd::Config;
use derbyd::Event;
use derbyd::EventBus;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// LED board fleet and race show daemon
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, value_parser = parse_log_level)]
    log_level: Option<LogLevel>,

    /// Skip network scanning; only statically configured devices are used
    #[arg(long)]
    no_discovery: bool,

    /// Start auto-progression as soon as the show is created
    #[arg(long)]
    autostart: bool,
}

fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        other => Err(format!("unknown log level '{}'", other)),
    }
}

fn init_logging(config: &Config, level: Option<LogLevel>) {
    let default: LevelFilter = level.unwrap_or(config.logging.level).into();
    let filter = config
        .logging
        .overrides
        .iter()
        .fold(Targets::new().with_default(default), |targets, (target, level)| {
            targets.with_target(target.clone(), LevelFilter::from(*level))
        });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    init_logging(&config, args.log_level);

    info!("derbyd starting");
    if let Some(path) = &args.config {
        info!("Loaded config from: {}", path.display());
    }

    let registry = Arc::new(Registry::new());
    let client: Arc<dyn DeviceClient> =
        Arc::new(HttpDeviceClient::new().context("building HTTP client")?);
    let events = Arc::new(EventBus::new());

    let discovery = Arc::new(Discovery::new(
        registry.clone(),
        client.clone(),
        config.discovery.clone(),
    ));
    let dispatcher = Dispatcher::new(registry.clone(), client.clone(), config.dispatcher.clone());
    let health = HealthMonitor::new(
        registry.clone(),
        client.clone(),
        config.health.clone(),
        config.discovery.device_timeout(),
        events.clone(),
    );
    let fleet: Arc<dyn CommandSink> = Arc::new(dispatcher.clone());
    let controller = PhaseController::new(config.show.clone(), Some(fleet), events.clone())
        .context("building phase controller")?;

    for device in &config.devices {
        match discovery
            .register(&device.device_id, &device.address, device.device_type)
            .await
        {
            Ok(registered) => info!(
                "Registered {} at {} ({})",
                registered.device_id(),
                registered.address,
                registered.status
            ),
            Err(e) => warn!("Failed to register {}: {}", device.device_id, e),
        }
    }

    health.subscribe(|alert| {
        warn!(
            "[{}] {} alert: {}",
            alert.device_id, alert.severity, alert.message
        )
    });

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    if config.discovery.enabled && !args.no_discovery {
        tasks.spawn(discovery.clone().run(cancel.clone()));
    } else {
        info!("Network discovery disabled");
    }
    {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { dispatcher.run(cancel).await });
    }
    {
        let health = health.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { health.run(cancel).await });
    }
    tasks.spawn(log_events(events.clone(), cancel.clone()));

    let state = controller.state();
    info!(
        "Show '{}' ready in {} with {} entities",
        state.name,
        state.state,
        controller.entities().len()
    );
    if args.autostart || config.show.autostart {
        controller.start().context("starting auto-progression")?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");
    controller.stop();
    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Background task failed: {}", e);
        }
    }
    info!("derbyd stopped");
    Ok(())
}

/// Log every event seen on the broadcast bridge
async fn log_events(events: Arc<EventBus>, cancel: CancellationToken) {
    let mut rx = events.bridge();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    warn!("Event log fell behind by {} events", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        match &event {
            Event::StateChange(change) => {
                info!("event {}: {} -> {}", event.name(), change.old_state, change.new_state)
            }
            Event::Results(results) => info!("event {}: winner {}", event.name(), results.win.name),
            _ => tracing::debug!("event {}", event.name()),
        }
    }
}
