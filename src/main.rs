mod config;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use prometheuslog_export::{ExportBridge, install_exporter};
use prometheuslog_logs::{MonitorError, Supervisor, validate_catalog};

/// How often overall progress is logged
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// prometheuslog - Expose metrics parsed from application logs to Prometheus
#[derive(Parser, Debug)]
#[command(name = "prometheuslog")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug mode
    #[arg(long)]
    debug: bool,

    /// Port to listen for metrics requests
    #[arg(short, long, default_value_t = 9091)]
    port: u16,

    /// Environment (staging, uat, or prod)
    #[arg(short, long, default_value = "prod")]
    environment: String,

    /// How often to flush available metrics (1s, 5s, 15s, 1h, ...)
    #[arg(short, long, default_value = "2s", value_parser = config::parse_duration)]
    flush_interval: Duration,

    /// Ingestion rate limit in lines per second, per application
    #[arg(
        short = 'r',
        long,
        default_value_t = 10000,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    max_ingestion_rate: u32,

    /// Full path to the prometheuslog.conf config file
    #[arg(short, long, value_name = "FILE")]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(config_file) = args.config_file.clone() else {
        eprintln!("You did not specify a config file, exiting...");
        process::exit(1);
    };

    let result = run(args, config_file).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args, config_file: PathBuf) -> Result<()> {
    validate_catalog().context("invalid metric catalog")?;

    info!(path = %config_file.display(), "Parsing config file...");
    let applications = config::load_config(&config_file)
        .context("Failed to parse the provided conf file")?;

    install_exporter(args.port).context("Failed to start the metrics endpoint")?;

    info!("Creating objects and applying metrics configuration..");
    let supervisor = Arc::new(Supervisor::new());
    for app in &applications {
        match supervisor.add_application(
            app.id,
            app.name.clone(),
            app.log_path.clone(),
            args.max_ingestion_rate,
            args.debug,
        ) {
            Ok(monitor) => info!(
                id = monitor.id(),
                name = monitor.name(),
                log = %monitor.log_path().display(),
                "Adding"
            ),
            Err(MonitorError::LogPathMissing(path)) => warn!(
                name = %app.name,
                path = %path.display(),
                "Skipping (file doesn't exist)"
            ),
            Err(e) => warn!(name = %app.name, error = %e, "Skipping"),
        }
    }
    if supervisor.is_empty() {
        warn!("No log files attached; /metrics will stay empty");
    }

    let cancel = CancellationToken::new();
    let bridge = ExportBridge::new(args.environment, args.flush_interval);
    info!(
        port = args.port,
        environment = bridge.environment(),
        flush_interval_ms = bridge.flush_interval().as_millis() as u64,
        "Service Started..."
    );
    tokio::spawn(bridge.run(Arc::clone(&supervisor), cancel.child_token()));

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for the interrupt signal")?;
                warn!("Got interrupt signal. Aborting service sanely...");
                cancel.cancel();
                process::exit(1);
            }

            _ = heartbeat.tick() => {
                info!(
                    applications = supervisor.len(),
                    lines_read = supervisor.total_lines_read(),
                    "heartbeat"
                );
            }
        }
    }
}
