use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. When a log file is configured a second,
/// non-rotating layer writes plain text to it; the returned guard must be held for the
/// lifetime of the process so buffered lines are flushed on exit.
pub fn init(config: &LoggingConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let default_directive = if verbose {
        "slot_watcher=debug,info".to_string()
    } else {
        format!("slot_watcher={}", config.level)
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_directive))?;

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    match &config.file {
        Some(file) => {
            let path = Path::new(file);
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", file))?;

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()?;

            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).try_init()?;
            Ok(None)
        }
    }
}
