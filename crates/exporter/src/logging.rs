//! Tracing subscriber wiring.
//!
//! Operational logs go to stderr; events on the `metrics` target carry
//! pre-encoded sample lines and are appended verbatim to a daily-rolled
//! file instead.

use std::fmt;
use std::path::Path;

use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Writes the `msg` field of a metrics event as-is, one line each.
struct RawLineFormatter;

struct MsgVisitor {
    msg: Option<String>,
}

impl Visit for MsgVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "msg" {
            self.msg = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "msg" {
            self.msg = Some(format!("{value:?}"));
        }
    }
}

impl<S, N> FormatEvent<S, N> for RawLineFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MsgVisitor { msg: None };
        event.record(&mut visitor);
        match visitor.msg {
            Some(msg) => writeln!(writer, "{msg}"),
            None => Ok(()),
        }
    }
}

/// Initiates the global tracing subscriber. The returned guard must be
/// held for the lifetime of the process to flush the metrics file.
pub(crate) fn init<P: AsRef<Path>>(
    metrics_file: Option<P>,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let fmt_layer = utils::logging::get_fmt_layer();

    let metrics_file = metrics_file
        .as_ref()
        .map(|p| p.as_ref())
        .unwrap_or(Path::new("logs/metrics.log"));
    let dir = metrics_file.parent().unwrap_or(Path::new("."));
    let file = metrics_file
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("metrics.log");

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let fmt_layer = fmt_layer.with_filter(env_filter.and(filter::filter_fn(|metadata| {
        !metadata.target().contains("metrics")
    })));

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(3)
        .build(dir)?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let metrics_layer = layer()
        .event_format(RawLineFormatter)
        .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target().contains("metrics")
        }));

    registry().with(fmt_layer).with(metrics_layer).init();
    Ok(file_guard)
}
