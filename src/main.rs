//! Siteproxy - Rewriting Web Proxy
//!
//! A same-origin gateway that:
//! - Fetches pages on behalf of clients and serves them from its own origin
//! - Rewrites HTML and CSS so relative references resolve against the target
//! - Injects an overlay script exactly once per proxied document
//! - Validates every target URL against an SSRF policy before any fetch
//! - Applies per-client fixed-window rate admission per endpoint class

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use siteproxy::config::AppConfig;
use siteproxy::fetcher::UpstreamFetcher;
use siteproxy::server::{router, AppState};

/// Siteproxy - Rewriting Web Proxy
#[derive(Parser, Debug)]
#[command(name = "siteproxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "siteproxy.toml", env = "SITEPROXY_CONFIG")]
    config: PathBuf,

    /// Override listen port
    #[arg(short, long, env = "SITEPROXY_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SITEPROXY_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "SITEPROXY_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start the server)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting siteproxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    let mut config = AppConfig::load(&args.config)?;

    if let Some(port) = args.port {
        config.server.port = port;
        info!("Listen port overridden to: {}", port);
    }

    config.validate()?;
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    let config = Arc::new(config);
    let fetcher = Arc::new(UpstreamFetcher::new(&config.upstream)?);
    let state = AppState::new(config.clone(), fetcher);

    state.admission.spawn_sweep_task(Duration::from_secs(
        config.rate_limit.sweep_interval_secs,
    ));

    let bind_addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    info!("Listening on {} (public URL: {})", bind_addr, config.server.public_url);
    info!("Press Ctrl+C to shutdown gracefully");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = shutdown_signal() => {
                info!("Received shutdown signal, initiating graceful shutdown...");
            }
        }
    })
    .await?;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("Failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

#[cfg(windows)]
async fn shutdown_signal() {
    use tokio::signal::windows::ctrl_break;

    let mut ctrl_break = ctrl_break().expect("Failed to install Ctrl+Break handler");
    ctrl_break.recv().await;
    info!("Received Ctrl+Break");
}
