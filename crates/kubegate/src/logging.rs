//! Structured logging setup.
//!
//! Logging is off unless an output is selected, so command output printed
//! by the client stays clean. Settings come from the environment:
//!
//! - `LOG_LEVEL`: trace, debug, info (default), warn, error
//! - `LOG_FORMAT`: `json`, anything else is text
//! - `LOG_OUTPUT`: `stdout`, `stderr` or `none` (default)
//! - `LOG_FILE`: path appended to, in addition to `LOG_OUTPUT`
//!
//! Use these field names consistently: `queue`, `reply_queue`,
//! `correlation_id`, `backend`.

use std::{fs::OpenOptions, io, path::PathBuf, str::FromStr, sync::Mutex};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::LevelFilter,
    fmt::{self, MakeWriter},
    prelude::*,
};

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Console destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    #[default]
    None,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            output: LogOutput::None,
            file: None,
        }
    }
}

impl LogConfig {
    /// Build from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(crate::config::env_lookup)
    }

    /// Build from an arbitrary variable lookup.
    ///
    /// Unknown levels fall back to info, unknown outputs to none.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("LOG_LEVEL")
            .and_then(|level| parse_level(&level))
            .unwrap_or(Level::INFO);
        let format = match lookup("LOG_FORMAT").as_deref() {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let output = match lookup("LOG_OUTPUT").map(|o| o.to_ascii_lowercase()).as_deref() {
            Some("stdout") => LogOutput::Stdout,
            Some("stderr") => LogOutput::Stderr,
            _ => LogOutput::None,
        };
        Self {
            level,
            format,
            output,
            file: lookup("LOG_FILE").map(PathBuf::from),
        }
    }

    /// Whether any destination is configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self.output, LogOutput::None) || self.file.is_some()
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_ascii_lowercase().as_str() {
        "warning" => Some(Level::WARN),
        "fatal" | "panic" => Some(Level::ERROR),
        other => Level::from_str(other).ok(),
    }
}

/// Error type for logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Failed to open log file: {0}")]
    FileOpen(#[from] io::Error),
    #[error("Failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Text => fmt::layer()
            .with_writer(writer)
            .with_target(false)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .flatten_event(true)
            .boxed(),
    }
}

/// Install the global subscriber.
///
/// Does nothing when no destination is configured.
///
/// # Errors
/// Returns error if the log file cannot be opened or a subscriber is
/// already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if !config.is_enabled() {
        return Ok(());
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();
    match config.output {
        LogOutput::Stdout => layers.push(layer(config.format, io::stdout, false)),
        LogOutput::Stderr => layers.push(layer(config.format, io::stderr, true)),
        LogOutput::None => {}
    }
    if let Some(path) = &config.file {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        layers.push(layer(config.format, Mutex::new(file), false));
    }

    let filter = EnvFilter::default().add_directive(LevelFilter::from_level(config.level).into());
    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers).with(filter))?;

    tracing::info!(
        log_level = %config.level,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> LogConfig {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        LogConfig::from_lookup(|key| vars.get(key).map(ToString::to_string))
    }

    #[test]
    fn test_defaults_disable_logging() {
        let config = from(&[]);
        assert_eq!(config, LogConfig::default());
        assert!(!config.is_enabled());
        tokio_test::assert_ok!(init_logging(&config));
    }

    #[test]
    fn test_reads_all_settings() {
        let config = from(&[
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "JSON"),
            ("LOG_OUTPUT", "stderr"),
            ("LOG_FILE", "/var/log/kubegate.log"),
        ]);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::Stderr);
        assert_eq!(config.file, Some(PathBuf::from("/var/log/kubegate.log")));
        assert!(config.is_enabled());
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(parse_level("WARNING"), Some(Level::WARN));
        assert_eq!(parse_level("fatal"), Some(Level::ERROR));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(from(&[("LOG_LEVEL", "loud")]).level, Level::INFO);
    }

    #[test]
    fn test_file_alone_enables_logging() {
        let config = from(&[("LOG_OUTPUT", "none"), ("LOG_FILE", "kubegate.log")]);
        assert_eq!(config.output, LogOutput::None);
        assert!(config.is_enabled());
    }
}
