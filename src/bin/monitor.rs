use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use bandwidth_monitor::config::MonitorConfig;
use bandwidth_monitor::version::VERSION;
use bandwidth_monitor::Monitor;

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "bandwidth-monitor.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // Default to `info` level if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

/// Periodically logs the compact summary until shutdown.
async fn summary_loop(
    monitor: Arc<Monitor>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            _ = ticker.tick() => {
                let summary = monitor.summary();
                for iface in &summary.interfaces {
                    info!(
                        interface = %iface.name,
                        state = %iface.state,
                        rx_rate = iface.rx_rate,
                        tx_rate = iface.tx_rate,
                        "Interface rates."
                    );
                }
                if let Some(top) = monitor.top_by_volume(1).first() {
                    info!(
                        ip = %top.ip,
                        hostname = %top.hostname,
                        total_bytes = top.total_bytes,
                        "Top talker."
                    );
                }
                match serde_json::to_string(&summary) {
                    Ok(json) => debug!(summary = %json, "Summary snapshot."),
                    Err(e) => error!(error = %e, "Failed to serialize summary."),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args = Args::parse();

    let config = MonitorConfig::load(args.config.as_deref())?;
    init_logging(&config.log_dir);
    config.log_fallbacks();
    info!(version = VERSION, mode = ?config.mode, "Starting bandwidth monitor...");

    let summary_interval = config.summary_interval;
    // Geo enrichment is provided by embedding applications; the binary runs without it.
    let monitor = Arc::new(Monitor::new(config, None));
    monitor.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let summary_task = tokio::spawn(summary_loop(monitor.clone(), summary_interval, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
    }
    info!("Shutdown signal received, stopping...");

    shutdown_tx.send_replace(());
    if let Err(e) = summary_task.await {
        error!(error = ?e, "Summary task ended abnormally.");
    }
    monitor.stop().await;
    Ok(())
}
