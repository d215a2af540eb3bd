//! Flowline - Main Entry Point
//!
//! Serves JSON-RPC over stdin/stdout. Logs go to stderr (and optionally a
//! rolling file); stdout carries protocol traffic only.

mod methods;
mod settings;
mod telemetry;

use anyhow::{Context, Result};
use flowline_core::RequestGovernor;
use flowline_transport::{TransportManager, HANDLER_DRAIN_TIMEOUT, WRITER_SHUTDOWN_TIMEOUT};
use settings::{FlowlineConfig, LogFormat};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Outer bound on transport shutdown after Ctrl+C, past its own drain and close limits
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(
    HANDLER_DRAIN_TIMEOUT.as_secs() + WRITER_SHUTDOWN_TIMEOUT.as_secs() + 1,
);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = settings::load()?;

    // 2. Initialize logging
    let log_guard = init_logging(&config)?;
    info!("Flowline v{} starting...", VERSION);

    // 3. Wire shared state
    let governor = Arc::new(RequestGovernor::new(&config.rate_limit, config.retry.clone())?);
    info!(
        refill_rate = governor.rate_limiter().refill_rate(),
        max_retries = config.retry.max_retries,
        "Request governor ready"
    );

    let transport = TransportManager::stdio();
    methods::register(&transport, governor);
    let stop = transport.stop_handle();

    // 4. Serve until stdin closes, a shutdown notification, or Ctrl+C
    let mut handle = tokio::spawn(transport.run());
    let outcome = tokio::select! {
        joined = &mut handle => joined.context("Transport task failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully...");
            stop.stop();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(joined) => joined.context("Transport task failed")?,
                Err(_) => {
                    warn!("Transport did not stop within {:?}", SHUTDOWN_TIMEOUT);
                    Ok(())
                }
            }
        }
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Transport failed");
    }
    info!("Shutdown complete.");

    telemetry::shutdown();
    drop(log_guard);

    // A pending stdin read parks a blocking thread the runtime would wait on
    std::process::exit(if outcome.is_ok() { 0 } else { 1 })
}

/// Install the global subscriber; the guard keeps the file writer alive
fn init_logging(config: &FlowlineConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Failed to create env filter")?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(match config.log_format {
        // Production: JSON structured logging
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let mut guard = None;
    if let Some(path) = &config.log_file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .with_context(|| format!("Invalid log file path: {}", path.display()))?;

        let (writer, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
        guard = Some(file_guard);
    }

    let (otel, otel_warning) = telemetry::otel_layer::<Registry>();
    if let Some(layer) = otel {
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(message) = otel_warning {
        warn!("{}", message);
    }
    Ok(guard)
}
