//! tgram-gateway: accepts TCP clients and relays them to agents over
//! datagram pipes.

use clap::Parser;
use std::path::PathBuf;
use tgram_gateway::{Gateway, GatewayConfig};
use tracing::{error, info, warn};

/// tgram-gateway: public side of a tgram tunnel
#[derive(Parser, Debug)]
#[command(name = "tgram-gateway", version, about = "tgram tunnel gateway")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.tgram/gateway.toml")]
    config: String,

    /// Datagram port agents connect to (overrides the config file)
    #[arg(long)]
    listener_port: Option<u16>,

    /// Default request time-to-live in seconds (overrides the config file)
    #[arg(long)]
    request_ttl: Option<u64>,

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

    info!(version = env!("CARGO_PKG_VERSION"), "starting tgram-gateway");

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(&config_path, cli.listener_port, cli.request_ttl) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let gateway = match Gateway::bind(config).await {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run(shutdown_signal()).await {
        error!(error = %e, "gateway error");
        std::process::exit(1);
    }

    info!("tgram-gateway stopped");
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
