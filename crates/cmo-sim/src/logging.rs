//! provides logging helpers

use std::collections::BTreeMap;
use std::fmt::{self};
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Target of the per-step pool snapshots.
pub(crate) const STATS_TARGET: &str = "cmo.stats";

/// Writes snapshot events as InfluxDB line protocol, `tag_` fields as tags.
struct LineProtocolFormatter;

#[derive(Default)]
struct FieldVisitor<'a> {
    tags: BTreeMap<&'a str, String>,
    fields: BTreeMap<&'a str, String>,
}

impl FieldVisitor<'_> {
    fn insert(&mut self, name: &'static str, value: String) {
        match name.strip_prefix("tag_") {
            Some(tag) => {
                self.tags.insert(tag, value);
            }
            None => {
                self.fields.insert(name, value);
            }
        }
    }
}

impl Visit for FieldVisitor<'_> {
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field.name(), format!("{value}u"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field.name(), format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for LineProtocolFormatter
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
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        write!(writer, "cmo_pool")?;
        for (key, value) in &visitor.tags {
            write!(writer, ",{key}={value}")?;
        }

        let fields = visitor
            .fields
            .iter()
            .filter(|(key, _)| **key != "message")
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        write!(writer, " {fields}")?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        writeln!(writer, " {timestamp}")
    }
}

fn is_stats(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() == STATS_TARGET
}

/// Install the global subscriber: human-readable events on stderr, and pool
/// snapshots in a daily-rolling file when `stats_file` is given. Keep the
/// returned guard alive until exit so buffered snapshots are flushed.
pub(crate) fn init(stats_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter.and(filter::filter_fn(|metadata| !is_stats(metadata))));

    let Some(stats_file) = stats_file else {
        registry().with(fmt_layer).init();
        return Ok(None);
    };

    let dir = stats_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = stats_file
        .file_name()
        .and_then(|name| name.to_str())
        .context("stats file needs a utf-8 file name")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
        .context("failed to create rolling file appender")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let stats_layer = layer()
        .event_format(LineProtocolFormatter)
        .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(is_stats));

    registry().with(fmt_layer).with(stats_layer).init();
    Ok(Some(file_guard))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use similar_asserts::assert_eq;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn snapshots_render_as_line_protocol() {
        let capture = Capture::default();
        let subscriber = registry().with(
            layer()
                .event_format(LineProtocolFormatter)
                .with_writer(capture.clone())
                .with_filter(filter::filter_fn(is_stats)),
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(
                target: STATS_TARGET,
                tag_step = "alloc",
                entitled = 1000u64,
                curr = 40u64,
                "snapshot"
            );
            tracing::info!("not a snapshot");
        });

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).expect("utf-8");
        let line = output.lines().next().expect("one line");
        let (head, timestamp) = line.rsplit_once(' ').expect("timestamp");
        assert_eq!(head, "cmo_pool,step=alloc curr=40u,entitled=1000u");
        assert!(timestamp.parse::<u128>().is_ok());
        assert_eq!(output.lines().count(), 1);
    }
}
