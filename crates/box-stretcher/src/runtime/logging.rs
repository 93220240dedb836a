use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "info,box_stretcher=debug,stretch_core=debug,stretch_io=debug";

/// Initialize the tracing subscriber with optional JSON output.
///
/// Logs go to stderr so stdout stays machine-readable. With `log_file`, a
/// JSON copy is appended there through a background writer; keep the
/// returned guard alive until exit so buffered lines are flushed.
pub fn init_tracing(json_output: bool, log_file: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json_output {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().pretty().with_writer(io::stderr))
            .init();
    }
    Ok(guard)
}
