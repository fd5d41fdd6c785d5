//! Shared tracing setup for the CLI: env-filter from `MAMA_LOG_LEVEL` plus a
//! daily-rotated file appender under `~/.mama/logs/`.

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Keep this alive for the lifetime of the process; dropping it flushes and
/// stops the background log writer.
pub struct TracingGuard {
    _file: tracing_appender::non_blocking::WorkerGuard,
}

/// Installs the global subscriber: stderr (respecting `level`, default from
/// `MAMA_LOG_LEVEL`, then "info") plus a non-blocking daily file appender.
pub fn init_tracing(logs_dir: &Path, level: Option<&str>) -> TracingGuard {
    let directive = level
        .map(str::to_string)
        .or_else(|| std::env::var("MAMA_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let appender = tracing_appender::rolling::daily(logs_dir, "mama.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init();

    TracingGuard { _file: guard }
}
