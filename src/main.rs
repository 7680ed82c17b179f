use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use slot_watcher::browser::{BrowserProvider, ChromeBrowser};
use slot_watcher::plugins::NotificationDispatcher;
use slot_watcher::session::{HttpSessionExtractor, SessionExtractor};
use slot_watcher::utils::logging;
use slot_watcher::{AppConfig, AppointmentScanner, MonitorLoop, MonitorSettings, SlotScanner};

#[derive(Parser)]
#[command(name = "slot-watcher")]
#[command(about = "Watches an appointment booking site and alerts on new matching slots")]
struct Cli {
    /// Path to a TOML configuration file, layered over config/default
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll until interrupted
    Run,
    /// Extract a session, scan every location once and print the results as JSON
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let _log_guard = logging::init(&config.logging, cli.verbose)?;

    info!("Starting Slot Watcher for {} location(s)", config.monitor.locations.len());

    if config.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.metrics.port)))
            .install()
            .context("Failed to start metrics exporter")?;
        info!("Metrics available on port {}", config.metrics.port);
    }

    let browser: Arc<dyn BrowserProvider> = Arc::new(
        ChromeBrowser::launch(&config.site, config.scanner.max_concurrent_locations)
            .context("Failed to launch browser")?,
    );
    let extractor: Arc<dyn SessionExtractor> = Arc::new(HttpSessionExtractor::new(&config.site)?);
    let scanner: Arc<dyn SlotScanner> = Arc::new(AppointmentScanner::from_config(&config, browser)?);

    let session = extractor
        .extract(config.extraction_request()?)
        .await
        .context("Failed to open a booking session")?;
    let session = Arc::new(session);

    match cli.command {
        Command::Check => {
            let report = scanner.scan(session).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run => {
            let dispatcher = Arc::new(NotificationDispatcher::from_config(&config));
            let monitor = MonitorLoop::new(scanner, extractor, dispatcher, MonitorSettings::from_config(&config));

            monitor.start(session, config.monitor.poll_interval())?;

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");

            if let Err(e) = monitor.stop() {
                warn!("Monitor was not running at shutdown: {}", e);
            }
            monitor.join().await?;

            let status = monitor.status();
            info!(
                "Completed {} tick(s), {} slot(s) tracked",
                status.ticks, status.registry_size
            );
        }
    }

    Ok(())
}
