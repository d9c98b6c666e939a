use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feed_relay::config::ConfigStore;
use feed_relay::rtsp::client::redact_url;
use feed_relay::rtsp::parse_source_url;
use feed_relay::state::AppState;
use feed_relay::utils::{bind_tcp_listener, listen_addr};
use feed_relay::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// feed-relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "feed-relay")]
#[command(version, about = "Relay one RTSP camera feed to many WebRTC viewers", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// RTSP source URL (overrides config file)
    #[arg(short = 's', long, value_name = "URL")]
    source: Option<String>,

    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting feed-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config_store = ConfigStore::load(args.config.as_deref()).await?;
    if let Some(path) = config_store.path() {
        tracing::info!("Configuration loaded from {}", path.display());
    }

    // CLI flags win over the file
    config_store.update(|config| {
        if let Some(source) = args.source.clone() {
            config.source.url = source;
        }
        if let Some(address) = args.address.clone() {
            config.web.bind_address = address;
        }
        if let Some(port) = args.http_port {
            config.web.http_port = port;
        }
    });

    let config = config_store.get();
    config.validate()?;

    // Ingest starts lazily, but a bad URL is worth a warning right away
    match parse_source_url(&config.source.url) {
        Ok(url) => tracing::info!("RTSP source: {}", redact_url(&url)),
        Err(e) => tracing::warn!("{}; viewers will be refused until it is fixed", e),
    }

    let addr = listen_addr(&config.web.bind_address, config.web.http_port)?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let state = AppState::new(config_store, shutdown_tx.clone());
    let app = web::create_router(state.clone());

    let listener = bind_tcp_listener(addr)?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);
    let listener = tokio::net::TcpListener::from_std(listener)?;

    let mut shutdown_rx = state.shutdown_signal();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await;
    if let Err(e) = result {
        tracing::error!("HTTP server error: {}", e);
    }
    cleanup(&state).await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "feed_relay=error,tower_http=error,webrtc=error",
        LogLevel::Warn => "feed_relay=warn,tower_http=warn,webrtc=error",
        LogLevel::Info => "feed_relay=info,tower_http=info,webrtc=warn",
        LogLevel::Verbose => "feed_relay=debug,tower_http=info,webrtc=warn",
        LogLevel::Debug => "feed_relay=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "feed_relay=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Clean up subsystems on shutdown
async fn cleanup(state: &std::sync::Arc<AppState>) {
    state.shutdown().await;
}
