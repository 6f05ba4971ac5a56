//! provides logging helpers

use tracing::Subscriber;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Console layer shared by every binary in the workspace.
///
/// `pretty` selects the multi-line colored formatter, otherwise events are
/// rendered on a single line with their source location.
pub fn get_fmt_layer<S>(pretty: bool) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if pretty {
        layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .boxed()
    } else {
        layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    }
}

/// initiate the global tracing subscriber
pub fn init() {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    registry()
        .with(get_fmt_layer(false).with_filter(env_filter))
        .init();
}
