// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::LogFormat;

/// Logging section embedded in session configuration files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Logging verbosity level
    #[serde(rename = "log-level")]
    pub level: Option<String>,

    #[serde(default)]
    pub format: LogFormat,

    /// Write to this file instead of stdout
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Parsed level, falling back to INFO for missing or unknown values
    pub fn level(&self) -> tracing::Level {
        self.level
            .as_deref()
            .and_then(|l| l.parse().ok())
            .unwrap_or(tracing::Level::INFO)
    }

    /// Install the global subscriber described by this section
    pub fn init(&self, component: &str) -> anyhow::Result<()> {
        match &self.file {
            Some(path) => crate::init_to_file(component, self.level(), self.format, path),
            None => crate::init(component, self.level(), self.format),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        let cfg = LoggingConfig {
            level: Some("chatty".into()),
            ..Default::default()
        };
        assert_eq!(cfg.level(), tracing::Level::INFO);

        let cfg = LoggingConfig {
            level: Some("debug".into()),
            ..Default::default()
        };
        assert_eq!(cfg.level(), tracing::Level::DEBUG);
    }
}
