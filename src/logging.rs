//! Tracing setup: rotating file output plus a compact stdout layer.
//!
//! `RUST_LOG` controls filtering (default "info"), e.g.
//! `RUST_LOG=deepharvest=debug,reqwest=warn`.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the global subscriber. Log files rotate daily under
/// `<output_dir>/logs/`.
pub fn init_logging<P: AsRef<Path>>(output_dir: P) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = output_dir.as_ref().join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_appender = tracing_appender::rolling::daily(&log_dir, "deepharvest.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false)
        .compact()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    // The guard must outlive the process for the non-blocking writer to
    // flush; leaking it is intentional for a CLI binary.
    Box::leak(Box::new(file_guard));

    tracing::debug!("logging initialized, files under {}", log_dir.display());
    Ok(())
}
