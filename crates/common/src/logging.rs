//! Logging setup and configuration
//!
//! Human-readable logs go to stderr because stdout carries host link frames.
//! When a [`ReportSender`] is supplied, warnings and errors are also forwarded
//! to the controlling process as `0xFC` log packets.

use crate::channel::ReportSender;
use protocol::{HostReport, LogLevel};
use std::fmt::Write as _;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Longest log line forwarded upward; longer messages are truncated
pub const MAX_FORWARDED_LOG_LEN: usize = 252;

/// Setup tracing subscriber for the application
///
/// `host` enables forwarding to the controlling process. `forward_debug`
/// additionally forwards `INFO` and `DEBUG` events.
pub fn setup_logging(
    default_level: &str,
    host: Option<ReportSender>,
    forward_debug: bool,
) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    let host_layer = host.map(|sender| HostLogLayer::new(sender, forward_debug));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(host_layer)
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialised: {}", e)))?;

    Ok(())
}

/// Stderr logging for the current thread until [`setup_logging`] runs
///
/// Covers the start-up window in which the configuration, and with it the
/// final log level, is still being read. Drop the guard before calling
/// [`setup_logging`].
pub fn bootstrap_logging(default_level: &str) -> tracing::subscriber::DefaultGuard {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));
    tracing::subscriber::set_default(subscriber)
}

/// Layer that turns tracing events into host log packets
pub struct HostLogLayer {
    sender: ReportSender,
    forward_debug: bool,
}

impl HostLogLayer {
    pub fn new(sender: ReportSender, forward_debug: bool) -> Self {
        Self {
            sender,
            forward_debug,
        }
    }

    fn host_level(&self, level: &Level) -> Option<LogLevel> {
        match *level {
            Level::ERROR => Some(LogLevel::Error),
            Level::WARN => Some(LogLevel::Warning),
            Level::INFO | Level::DEBUG if self.forward_debug => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(level) = self.host_level(event.metadata().level()) else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut message = visitor.finish();
        truncate_on_char_boundary(&mut message, MAX_FORWARDED_LOG_LEN);

        // Dropped when the bridge is full; stderr still has the line.
        self.sender.try_send(HostReport::Log { level, message });
    }
}

/// Collects the `message` field first, then `key=value` for the rest
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
