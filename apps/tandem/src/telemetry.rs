use std::fs::OpenOptions;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. With `log_file` set, output goes there
/// through a background writer whose guard must be kept alive.
pub fn init_tracing(filter: &str, log_file: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let fmt_layer = fmt::layer().with_ansi(false).with_writer(writer);
            Registry::default().with(env_filter).with(fmt_layer).init();
            Ok(Some(guard))
        }
        None => {
            let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
            Registry::default().with(env_filter).with(fmt_layer).init();
            Ok(None)
        }
    }
}
