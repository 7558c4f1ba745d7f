//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format::DefaultFields;
use tracing_subscriber::fmt::format::Format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Returns the stderr fmt layer shared by all binaries.
pub fn get_fmt_layer<S>() -> Layer<S, DefaultFields, Format, fn() -> std::io::Stderr> {
    layer()
        .with_writer(std::io::stderr as fn() -> std::io::Stderr)
        .with_target(true)
}

/// initiate the global tracing subscriber
pub fn init() {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = get_fmt_layer().with_filter(env_filter);

    registry().with(fmt_layer).init();
}
