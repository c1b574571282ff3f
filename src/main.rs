//! probeagent binary: load configuration, run the agent until signalled.

use probeagent::agent::Agent;
use probeagent::collector::in_contained_probe;
use probeagent::config::{BootstrapConfig, ConfigSource, JsonFileConfigSource};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bootstrap = BootstrapConfig::load();
    let source = Arc::new(JsonFileConfigSource::new(&bootstrap.config_path));

    // The level is needed before the agent loads (and validates) the config.
    let level = source
        .load()
        .map(|cfg| cfg.logging.level)
        .unwrap_or_else(|_| "info".to_string());

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(format!("probeagent={}", level).parse()?))
        .init();

    install_panic_hook();

    tracing::info!("Starting probeagent {}...", env!("CARGO_PKG_VERSION"));
    tracing::info!("Using configuration at {}", bootstrap.config_path.display());

    let agent = Agent::new(source);
    agent.start().await?;

    wait_for_shutdown(&agent).await?;

    agent.stop().await?;
    Ok(())
}

/// Panics outside a probe task are fatal; probe panics become results.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if in_contained_probe() {
            tracing::error!(panic = %info, "Probe task panicked");
            return;
        }
        tracing::error!(panic = %info, "Unrecoverable panic, exiting");
        default_hook(info);
        std::process::exit(1);
    }));
}

#[cfg(unix)]
async fn wait_for_shutdown(agent: &Arc<Agent>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received interrupt, shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                return Ok(());
            }
            _ = hangup.recv() => {
                tracing::info!("Received SIGHUP, reloading configuration");
                if let Err(e) = agent.reload_config().await {
                    tracing::error!(error = %e, "Reload failed, previous collectors keep running");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_agent: &Arc<Agent>) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received interrupt, shutting down");
    Ok(())
}
