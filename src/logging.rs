//! Logging for the daemon: a rolling file under the data directory plus
//! a compact stderr feed.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;

/// Default verbosity when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

/// File name prefix for the daily-rolled log.
const LOG_FILE: &str = "skipperd.log";

/// Owns the background file writer.  Dropping it flushes and closes the
/// stream, so the daemon holds it until exit.
pub struct LogGuard {
    _file_writer: WorkerGuard,
}

/// Install the global subscriber.
///
/// Logs land in `{data_dir}/logs/` (daily rotation) and on stderr.
/// `RUST_LOG` overrides the default `info` filter, and `log::` macro call
/// sites across the crate forward into the same pipeline.
pub fn init(data_dir: &Path) -> LogGuard {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();

    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        &log_dir,
        LOG_FILE,
    ));

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(file_writer);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();
    if installed {
        tracing_log::LogTracer::init().ok();
    }

    log::info!(
        "skipperd {} logging to {}",
        env!("CARGO_PKG_VERSION"),
        log_dir.display()
    );
    LogGuard {
        _file_writer: guard,
    }
}
