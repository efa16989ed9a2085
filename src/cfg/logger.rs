// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Debug;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{Event, Subscriber};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        self, FmtContext, FormatEvent, FormatFields,
        format::{JsonFields, Writer},
        writer::BoxMakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
};

use crate::cfg::config::DaemonConfig;

/// One structured log line.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    level: String,
    target: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

struct JsonFormatter;

impl<S, N> FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            fields: visitor.fields,
        };

        writeln!(
            writer,
            "{}",
            serde_json::to_string(&entry).map_err(|_| std::fmt::Error)?
        )
    }
}

#[derive(Default)]
struct JsonVisitor {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn Debug) {
        self.fields
            .insert(field.name().to_string(), json!(format!("{value:?}")));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(field.name().to_string(), json!(value));
    }
}

/// Initialize the daemon logging subsystem.
///
/// With a log file configured, lines are appended there; otherwise they go
/// to stderr. With `use-syslog` the stderr stream is structured for a
/// syslog collector; routing it is the deployment's job.
pub fn init_logger(config: &DaemonConfig) -> Result<WorkerGuard> {
    let (writer, guard) = make_writer(config)?;

    let env_filter = EnvFilter::try_new(config.log_level.as_filter())
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level")?;

    let json_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .json()
        .event_format(JsonFormatter)
        .fmt_fields(JsonFields::default());

    let subscriber = Registry::default().with(env_filter).with(json_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(guard)
}

fn make_writer(config: &DaemonConfig) -> Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(match &config.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new(""));
            let appender = RollingFileAppender::new(
                Rotation::NEVER,
                dir,
                path.file_name().unwrap_or_default(),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), guard)
        },
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (BoxMakeWriter::new(writer), guard)
        },
    })
}
