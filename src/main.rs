//! telemetry-relay - stdin to collector delivery relay
//!
//! Reads newline-delimited JSON events from stdin and delivers them to the
//! collector through the full pipeline: batching, transport fallback and the
//! durable retry store.
//!
//! # Usage
//!
//! ```bash
//! # Relay events produced by another process
//! ./producer | telemetry-relay --endpoint https://collector.example/collect
//!
//! # Request immediate delivery for one event
//! echo '{"event":"crash","_immediate":true}' | telemetry-relay
//!
//! # Forward host lifecycle signals
//! echo '{"_signal":"offline"}' | telemetry-relay
//! ```
//!
//! # Environment Variables
//!
//! - `RELAY_CONFIG`: Path to a TOML config file (default: `./relay.toml`)
//! - `RELAY_ENDPOINT`: Collector endpoint, overrides the config file
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use telemetry_relay::config::RelayConfig;
use telemetry_relay::pipeline::source::{EventSource, LineSource, SourceEvent};
use telemetry_relay::pipeline::PipelineBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "telemetry-relay")]
#[command(about = "Reliable telemetry delivery relay")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML config file. Skips the RELAY_CONFIG / ./relay.toml search.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Collector endpoint URL
    #[arg(long, env = "RELAY_ENDPOINT")]
    endpoint: Option<String>,

    /// Directory of the durable retry store
    #[arg(long, value_name = "DIR")]
    store_path: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &CliArgs) -> Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RelayConfig::load(),
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(store_path) = &args.store_path {
        config.retry.store_path = store_path.clone();
    }
    config.validate().context("Invalid relay configuration")?;
    Ok(config)
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.json);

    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let pipeline = PipelineBuilder::new(config)
        .start()
        .context("Failed to start telemetry pipeline")?;

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    let mut source = LineSource::stdin();
    info!(source = source.source_name(), "Relaying events");

    let mut relayed = 0u64;
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            event = source.next_event() => match event {
                Ok(SourceEvent::Record { fields, immediate }) => {
                    pipeline.report(fields, immediate);
                    relayed += 1;
                }
                Ok(SourceEvent::Signal(signal)) => pipeline.handle_signal(signal).await,
                Ok(SourceEvent::Eof) => {
                    info!(relayed, "Input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input, shutting down");
                    break;
                }
            },
        }
    }

    let stats = pipeline.shutdown().await;
    let pending = stats.persisted.saturating_sub(stats.replayed + stats.evicted);
    if pending > 0 {
        info!(pending, "Undelivered records kept in retry store for next run");
    }
    info!(
        relayed,
        enqueued = stats.enqueued,
        delivered = stats.delivered,
        persisted = stats.persisted,
        replayed = stats.replayed,
        evicted = stats.evicted,
        "telemetry-relay shutdown complete"
    );
    Ok(())
}
