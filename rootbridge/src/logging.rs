//! Structured logging bootstrap: an `EnvFilter`-driven registry with a
//! colorized text layer when attached to a terminal and a JSON layer
//! otherwise, built by hand rather than pulling in `tracing-subscriber`'s
//! own `json` feature.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use rootbridge_core::config::LogFormat;
use time::{format_description, UtcOffset};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_log::LogTracer;
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::Cli;

pub fn init(cli: &Cli, configured_format: LogFormat) -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        match cli.debug {
            0 => std::env::set_var("RUST_LOG", "rootbridge=info,rootbridge_core=info"),
            1 => std::env::set_var("RUST_LOG", "rootbridge=debug,rootbridge_core=debug"),
            _ => std::env::set_var("RUST_LOG", "debug"),
        }
    }

    LogTracer::init().context("failed to initialize log compatibility layer")?;

    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let env_filter = Arc::new(EnvFilter::from_default_env());
    let enable_colors = console::user_attended();

    let registry = tracing_subscriber::registry();

    let json_layer = (configured_format == LogFormat::Json).then(|| {
        let env_filter = env_filter.clone();
        JsonLogLayer.with_filter(dynamic_filter_fn(move |m, c| env_filter.enabled(m, c.clone())))
    });

    let text_layer = (configured_format == LogFormat::Text).then(|| {
        let env_filter = env_filter.clone();
        tracing_subscriber::fmt::layer()
            .with_ansi(enable_colors)
            .with_timer(OffsetTime::new(
                offset,
                format_description::parse("[day].[month].[year] [hour]:[minute]:[second]")
                    .expect("valid time format"),
            ))
            .with_filter(dynamic_filter_fn(move |m, c| env_filter.enabled(m, c.clone())))
    });

    registry.with(json_layer).with(text_layer).init();
    Ok(())
}

struct JsonLogLayer;

#[derive(serde::Serialize)]
struct JsonLogEntry<'a> {
    timestamp: String,
    level: &'static str,
    target: &'a str,
    message: String,
}

impl<S> Layer<S> for JsonLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut message = String::new();
        event.record(&mut MessageVisitor(&mut message));

        let entry = JsonLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level_to_str(event.metadata().level()),
            target: event.metadata().target(),
            message,
        };
        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = writeln!(std::io::stdout(), "{json}");
        }
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{value:?}");
        }
    }
}

fn level_to_str(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}
