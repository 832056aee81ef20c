//! Datadog Log Sink Binary
//!
//! Reads newline-delimited JSON log events from stdin and ships them to Datadog.

use clap::Parser;
use datadog_log_sink::{BlockingDispatcher, Config, FailurePolicy, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version, about = "Ship newline-delimited JSON log events to Datadog")]
struct Args {
    /// JSON configuration file; DD_* environment variables override it
    #[arg(short, long, env = "DD_CONFIG")]
    config: Option<PathBuf>,

    /// Number of events per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Report delivery failures instead of swallowing them
    #[arg(long)]
    fail_closed: bool,
}

fn main() {
    initialize_tracing();

    info!("Starting Datadog log sink v{}", env!("CARGO_PKG_VERSION"));

    match run(Args::parse()) {
        Ok(0) => {}
        Ok(failed) => {
            error!("{} events could not be delivered", failed);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Log sink failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Pump stdin through the dispatcher; returns the number of failed events.
fn run(args: Args) -> Result<usize> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?.with_env_overrides(),
        None => Config::from_env(),
    };
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.fail_closed {
        config.failure_policy = FailurePolicy::FailClosed;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e);
    }

    info!(
        "Sink configuration - Source: {:?}, Service: {:?}, TCP: {}, SSL: {}, Batch size: {}",
        config.source, config.service, config.use_tcp, config.use_ssl, config.batch_size
    );

    let dispatcher = BlockingDispatcher::from_config(&config)?;
    let result = dispatcher.forward_lines(std::io::stdin().lock(), config.batch_size);
    dispatcher.close();

    info!("Input exhausted, sink closed");
    result
}

/// Initialize structured logging on stderr
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
