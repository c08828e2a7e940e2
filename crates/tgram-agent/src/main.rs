//! tgram-agent: registers local backends with a tgram gateway and serves
//! the requests it relays.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tgram_agent::{Agent, AgentConfig};
use tracing::{error, info, warn};

/// tgram-agent: private side of a tgram tunnel
#[derive(Parser, Debug)]
#[command(name = "tgram-agent", version, about = "tgram tunnel agent")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.tgram/agent.toml")]
    config: String,

    /// Gateway address as host:port (overrides every pipe in the config file)
    #[arg(short, long)]
    gateway: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tgram-agent");

    if let Err(e) = run(cli).await {
        error!("tgram-agent failed: {e:#}");
        std::process::exit(1);
    }

    info!("tgram-agent stopped");
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = PathBuf::from(&cli.config);
    let config = AgentConfig::load(&config_path, cli.gateway.as_deref())
        .with_context(|| format!("failed to load config {}", cli.config))?;

    let agent = Agent::bind(config).await.context("failed to start agent")?;
    agent.run(shutdown_signal()).await.context("agent error")?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
