// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Centralized logging utilities for the keeper workspace
//!
//! Applications embedding the client install a subscriber once through this
//! crate; the library crates only emit `tracing` events and never install one
//! themselves.

pub mod logging_config;

pub use logging_config::LoggingConfig;

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Arc, Mutex, OnceLock};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// Re-export Level for convenience
pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: {}. Use 'plaintext' or 'json'",
                s
            )),
        }
    }
}

/// Initialize logging to stdout
///
/// # Example
/// ```rust
/// use keeper_logging::{init, Level, LogFormat};
///
/// fn main() -> anyhow::Result<()> {
///     init("keeper-client", Level::INFO, LogFormat::Plaintext)?;
///     tracing::info!("Application started");
///     Ok(())
/// }
/// ```
pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stdout)
}

/// Initialize logging to a file, creating parent directories as needed
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &std::path::Path,
) -> anyhow::Result<()> {
    use std::fs;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let log_file = fs::OpenOptions::new().create(true).append(true).open(log_path)?;

    init_with_writer(component, default_level, format, Mutex::new(log_file))
}

/// Build the filter used when `RUST_LOG` is not set
fn default_filter(component: &str, default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let target = component.replace('-', "_");
        EnvFilter::new(format!("{},{}={}", default_level, target, default_level))
    })
}

/// Initialize logging with a custom writer
pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = default_filter(component, default_level);

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Shared buffer that captures test log output
pub type TestLogBuffer = Arc<Mutex<Vec<u8>>>;

/// Initialize logging for tests, capturing output into a shared buffer.
///
/// The first call installs the subscriber; later calls in the same process
/// return the same buffer.
pub fn init_for_test(component: &str, default_level: Level) -> TestLogBuffer {
    use std::io::Write;
    use std::sync::MutexGuard;
    use tracing_subscriber::fmt::MakeWriter;

    static BUFFER: OnceLock<TestLogBuffer> = OnceLock::new();

    struct BufferWriter(TestLogBuffer);
    struct BufferGuard<'a>(MutexGuard<'a, Vec<u8>>);

    impl<'a> Write for BufferGuard<'a> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for BufferWriter {
        type Writer = BufferGuard<'a>;
        fn make_writer(&'a self) -> Self::Writer {
            BufferGuard(self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
        }
    }

    BUFFER
        .get_or_init(|| {
            let shared = Arc::new(Mutex::new(Vec::new()));
            let writer = BufferWriter(shared.clone());
            // Another subscriber may already be installed by the test harness.
            let _ = init_with_writer(component, default_level, LogFormat::Plaintext, writer);
            shared
        })
        .clone()
}

/// Redact sensitive information from log output
///
/// # Example
/// ```rust
/// use keeper_logging::redact;
///
/// let credentials = "super:secret";
/// tracing::info!(auth = %redact(credentials), "adding auth");
/// // Output: auth="[REDACTED]"
/// ```
pub fn redact(_value: impl std::fmt::Display) -> &'static str {
    "[REDACTED]"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, error, info, warn};

    #[test]
    fn test_redact() {
        let redacted = redact("sensitive-data");
        assert_eq!(format!("{}", redacted), "[REDACTED]");
        assert_eq!(format!("{:?}", redacted), "\"[REDACTED]\"");
    }

    #[test]
    fn test_log_format_round_trip() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!(LogFormat::Plaintext.to_string(), "plaintext");
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_init_for_test_is_idempotent() {
        let first = init_for_test("keeper-logging", Level::DEBUG);
        let second = init_for_test("keeper-logging", Level::DEBUG);
        assert!(Arc::ptr_eq(&first, &second));

        error!("Test error message");
        warn!("Test warning message");
        info!("Test info message");
        debug!("Test debug message");
    }

    #[test]
    fn test_second_global_init_fails() {
        let _ = init_for_test("keeper-logging", Level::INFO);
        assert!(init("keeper-logging", Level::INFO, LogFormat::Plaintext).is_err());
    }

    #[test]
    fn test_init_to_file_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("keeper.log");
        // The global subscriber may already be taken by another test; the
        // file and its directory are created before installation either way.
        let _ = init_to_file("keeper-logging", Level::INFO, LogFormat::Json, &path);
        assert!(path.exists());
    }
}
