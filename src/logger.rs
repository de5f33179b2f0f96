use std::path::PathBuf;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub log_level: LogLevel,
    /// Write a rolling text log plus a JSON event log here instead of stderr.
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self { log_level, log_dir }
    }

    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.log_level.as_ref()))
    }
}

/// Install the global tracing subscriber.
///
/// With a log directory, plain-text logs go to `plumline.log` and process and
/// task lifecycle events (targets under `plumline`) go as JSON lines to
/// `events.log`, both rotated daily. Keep the returned guards alive for the
/// lifetime of the program so buffered lines are flushed.
pub fn init_tracing(config: &LogConfig) -> Result<Vec<WorkerGuard>> {
    match &config.log_dir {
        None => {
            Registry::default()
                .with(config.filter())
                .with(fmt::layer().with_writer(std::io::stderr).with_thread_names(true))
                .try_init()
                .context("a global tracing subscriber is already installed")?;
            Ok(Vec::new())
        }
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;

            let (txt_writer, txt_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, "plumline.log"));
            let txt_layer = fmt::layer().with_writer(txt_writer).with_ansi(false);

            let (json_writer, json_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, "events.log"));
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_writer)
                .with_target(true)
                .with_filter(EnvFilter::new("plumline=info"));

            Registry::default()
                .with(config.filter())
                .with(txt_layer)
                .with(json_layer)
                .try_init()
                .context("a global tracing subscriber is already installed")?;
            Ok(vec![txt_guard, json_guard])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert_eq!(LogConfig::default().log_level, LogLevel::Info);
    }
}
