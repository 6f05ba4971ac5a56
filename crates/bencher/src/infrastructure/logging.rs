//! Run logging: console output plus a plain copy inside the run directory.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

pub const LOG_FILE: &str = "bencher.log";

fn env_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber for a run
///
/// The returned guard flushes `<run_dir>/bencher.log` when dropped and must
/// be kept alive until the process exits.
pub fn init(level: LevelFilter, pretty: bool, run_dir: &Path) -> WorkerGuard {
    let console = utils::logging::get_fmt_layer(pretty).with_filter(env_filter(level));

    let appender = tracing_appender::rolling::never(run_dir, LOG_FILE);
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let file = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter(level));

    registry().with(console).with(file).init();
    file_guard
}
