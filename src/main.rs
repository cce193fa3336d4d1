//! Hang monitor - counts and lists UI hangs reported by a host's histograms
//!
//! Polls cumulative histograms, keeps a badge of new qualifying hangs since the
//! last clear, and reconstructs recent individual hangs per call stack.
//!
//! Module structure:
//! - `domain/` - Histograms, thresholds, hang records, modes
//! - `io/` - Histogram sources, notifications, HTTP control endpoint
//! - `services/` - Threshold totals, hang diffing, counter, poll loop
//! - `infra/` - Infrastructure (Config, Metrics, Errors)

use clap::Parser;
use hang_monitor::domain::Mode;
use hang_monitor::infra::{Config, Metrics};
use hang_monitor::io::{
    start_control_server, ControlContext, MemoryClipboard, SnapshotSource, StatusBoard,
};
use hang_monitor::services::{command_channel, PollLoop};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

fn parse_mode(s: &str) -> Result<Mode, String> {
    Mode::parse(s).ok_or_else(|| {
        let known: Vec<&str> = Mode::ALL.iter().map(Mode::as_str).collect();
        format!("unknown mode '{}', expected one of: {}", s, known.join(", "))
    })
}

/// Hang monitor - badge and history of UI hangs
#[derive(Parser, Debug)]
#[command(name = "hang-monitor", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured mode
    #[arg(long, value_parser = parse_mode)]
    mode: Option<Mode>,

    /// Override the configured threshold in ms (values below 1 use the default)
    #[arg(long, allow_negative_numbers = true)]
    threshold: Option<i64>,

    /// Emit a blip notification whenever the badge goes up
    #[arg(long)]
    play_sound: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("hang-monitor starting");

    let args = Args::parse();

    let config_path = Config::resolve_config_path(args.config.as_deref());
    let mut config = Config::load_from_path(&config_path);
    if let Some(mode) = args.mode {
        config = config.with_mode(mode);
    }
    if let Some(threshold) = args.threshold {
        config = config.with_threshold(threshold);
    }
    if args.play_sound {
        config = config.with_play_sound(true);
    }

    info!(
        config_file = %config.config_file(),
        mode = %config.mode(),
        threshold = %config.threshold(),
        play_sound = %config.play_sound(),
        poll_interval_ms = %config.poll_interval().as_millis(),
        subordinate_cache_ms = %config.subordinate_cache_ttl().as_millis(),
        main_snapshot = %config.main_snapshot(),
        subordinate_dir = %config.subordinate_dir(),
        control_port = %config.control_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create shared components
    let metrics = Arc::new(Metrics::new());
    let status = Arc::new(StatusBoard::new());
    let source = Arc::new(SnapshotSource::new(config.main_snapshot(), config.subordinate_dir()));
    let (engine, command_rx) = command_channel(64);

    // Start HTTP control server (if port > 0)
    let control_port = config.control_port();
    if control_port > 0 {
        let ctx = Arc::new(ControlContext {
            status: status.clone(),
            metrics: metrics.clone(),
            engine: engine.clone(),
        });
        let control_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_control_server(control_port, ctx, control_shutdown).await {
                tracing::error!(error = %format!("{:#}", e), "control_server_error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let poll_loop = PollLoop::new(&config, source, status, Arc::new(MemoryClipboard::new()), metrics);

    // Run poll loop until shutdown; the engine handle keeps the command channel open
    poll_loop.run(command_rx, shutdown_rx).await;
    drop(engine);

    info!("hang-monitor shutdown complete");
    Ok(())
}
