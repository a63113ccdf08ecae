//! Logging setup. Only the setup phase logs; cycle loops never do.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Logger settings, read from the `[Logging]` table or the environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggerConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
    /// Directory of the rolling log files; stdout when absent.
    pub file_dir: Option<String>,
    /// File name prefix of the rolling log files.
    pub file_prefix: Option<String>,
    /// `minutely`, `hourly` or `daily`.
    pub rolling: Option<String>,
    /// Number of rotated files kept.
    #[serde(default)]
    pub max_files: usize,
}

impl LoggerConfig {
    /// Read `LOG_LEVEL`, `LOG_FILE_DIR`, `LOG_FILE_PREFIX` and `LOG_ROLLING`.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file_dir: std::env::var("LOG_FILE_DIR").ok(),
            file_prefix: std::env::var("LOG_FILE_PREFIX").ok(),
            rolling: std::env::var("LOG_ROLLING").ok(),
            max_files: 2,
        }
    }

    /// Parsed level; unknown names fall back to `info`.
    pub fn level(&self) -> Level {
        Level::from_str(&self.level).unwrap_or(Level::INFO)
    }

    fn rotation(&self) -> Rotation {
        match self.rolling.as_deref() {
            Some("minutely") => Rotation::MINUTELY,
            Some("hourly") => Rotation::HOURLY,
            _ => Rotation::DAILY,
        }
    }

    /// Install the global subscriber.
    ///
    /// The returned guard must be kept alive while logging to a file. A
    /// subscriber that is already installed is left in place.
    pub fn init(&self) -> Result<Option<WorkerGuard>> {
        let level = self.level();
        match self.file_dir.as_deref() {
            Some(dir) => {
                let prefix = self.file_prefix.as_deref().unwrap_or("gamrt");
                let appender = RollingFileAppender::builder()
                    .rotation(self.rotation())
                    .max_log_files(self.max_files.max(1))
                    .filename_prefix(prefix)
                    .build(dir)
                    .map_err(|e| {
                        Error::parameters(format!("cannot create log appender in {dir}: {e}"))
                    })?;
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let _ = tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_writer(writer)
                    .try_init();
                tracing::info!(dir, prefix, "logging to rolling files");
                Ok(Some(guard))
            }
            None => {
                let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
                Ok(None)
            }
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_fallback() {
        let mut config = LoggerConfig::default();
        assert_eq!(config.level(), Level::INFO);
        config.level = "debug".into();
        assert_eq!(config.level(), Level::DEBUG);
        config.level = "loud".into();
        assert_eq!(config.level(), Level::INFO);
    }

    #[test]
    fn deserialises_from_toml() {
        let config: LoggerConfig =
            toml::from_str("level = \"warn\"\nrolling = \"hourly\"\n").unwrap();
        assert_eq!(config.level(), Level::WARN);
        assert_eq!(config.max_files, 0);
        assert!(config.file_dir.is_none());
    }
}
