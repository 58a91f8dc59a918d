//! Console logging.
//!
//! Library crates log through the `log` facade. [`init`] bridges those records
//! into `tracing`, filters them with `RUST_LOG` (default `info`) and hands each
//! line to a background task that writes it to stdout.

use std::fmt::{self, Write as _};
use std::io::{self, Write as _};

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_log::{AsLog, LogTracer, NormalizeEvent};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

/// A formatted-later log line.
#[derive(Debug, Clone)]
pub struct LogLine {
    time: DateTime<Local>,
    level: Level,
    module_path: String,
    message: String,
    extra: String,
}

impl LogLine {
    /// Renders the line with the given options.
    #[must_use]
    pub fn render(&self, options: LogConfig) -> String {
        let mut line = String::new();
        if options.time {
            let _ = write!(line, "{} ", self.time.format("%T:%3f"));
        }
        let _ = write!(line, "{:>5}", self.level.as_str());
        if options.module_path && !self.module_path.is_empty() {
            let _ = write!(line, " {}", self.module_path);
        }
        let _ = write!(line, " {}", self.message);
        if options.extra && !self.extra.is_empty() {
            let _ = write!(line, " {{{}}}", self.extra.trim_start());
        }
        line
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    extra: String,
}

impl LineVisitor {
    fn push(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        match field.name() {
            "message" => {
                let _ = self.message.write_fmt(value);
            }
            // Already carried by the normalized metadata
            name if name.starts_with("log.") => {}
            name => {
                let _ = write!(self.extra, " {name}={value}");
            }
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, format_args!("{value}"));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format_args!("{value:?}"));
    }
}

/// A `tracing` layer forwarding events to the writer task.
pub struct LoggerLayer {
    sender: mpsc::UnboundedSender<LogLine>,
}

impl<S: Subscriber> Layer<S> for LoggerLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let normalized = event.normalized_metadata();
        let metadata = normalized.as_ref().unwrap_or_else(|| event.metadata());

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        // The writer is gone only after shutdown; nothing left to show then.
        let _ = self.sender.send(LogLine {
            time: Local::now(),
            level: *metadata.level(),
            module_path: metadata
                .module_path()
                .unwrap_or_else(|| metadata.target())
                .to_owned(),
            message: visitor.message,
            extra: visitor.extra,
        });
    }
}

/// The running logger. Call [`Logger::shutdown`] to flush pending lines.
pub struct Logger {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Logger {
    /// Stops the writer task after it has written everything already logged.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        let _ = self.task.await;
    }
}

/// Installs the global logger. Must be called from inside the tokio runtime.
pub fn init(options: LogConfig) -> anyhow::Result<Logger> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let max_level = filter
        .max_level_hint()
        .map_or(log::LevelFilter::Trace, |level| level.as_log());

    let (sender, receiver) = mpsc::unbounded_channel();
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(LoggerLayer { sender });
    tracing::subscriber::set_global_default(subscriber)?;
    LogTracer::init_with_filter(max_level)?;

    let cancel_token = CancellationToken::new();
    let task = tokio::spawn(log_loop(receiver, options, cancel_token.clone()));
    Ok(Logger { cancel_token, task })
}

async fn log_loop(
    mut receiver: mpsc::UnboundedReceiver<LogLine>,
    options: LogConfig,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            Some(line) = receiver.recv() => write_line(&line, options),
            () = cancel_token.cancelled() => break,
        }
    }
    while let Ok(line) = receiver.try_recv() {
        write_line(&line, options);
    }
}

fn write_line(line: &LogLine, options: LogConfig) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "{}", line.render(options));
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn line() -> LogLine {
        LogLine {
            time: Local
                .with_ymd_and_hms(2024, 5, 1, 13, 4, 5)
                .single()
                .expect("unambiguous time"),
            level: Level::WARN,
            module_path: "pulse_core::driver".to_owned(),
            message: "Can't keep up!".to_owned(),
            extra: " behind_ms=2500".to_owned(),
        }
    }

    #[test]
    fn test_render_all_options() {
        let options = LogConfig {
            time: true,
            module_path: true,
            extra: true,
        };
        assert_eq!(
            line().render(options),
            "13:04:05:000  WARN pulse_core::driver Can't keep up! {behind_ms=2500}"
        );
    }

    #[test]
    fn test_render_bare() {
        let options = LogConfig {
            time: false,
            module_path: false,
            extra: false,
        };
        assert_eq!(line().render(options), " WARN Can't keep up!");
    }
}
