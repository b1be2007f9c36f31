// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session configuration and connect-string parsing

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use keeper_logging::LoggingConfig;
use keeper_proto::{CONFIG_NODE, validate_path};
use serde::{Deserialize, Serialize};

use crate::error::ZkError;
use crate::path::{ChrootPrefix, PathTranslator};

/// Port used when a connect-string host omits one
pub const DEFAULT_PORT: u16 = 2181;

const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 30_000;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid connect string '{input}': {reason}")]
    ConnectString { input: String, reason: String },
    #[error("invalid path in configuration: {0}")]
    Path(#[from] ZkError),
    #[error("response timeout must be greater than zero")]
    ZeroTimeout,
}

/// One ensemble member address
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parsed `host[:port][,host[:port]...][/chroot]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectString {
    hosts: Vec<HostPort>,
    chroot: Option<ChrootPrefix>,
}

impl ConnectString {
    pub fn hosts(&self) -> &[HostPort] {
        &self.hosts
    }

    pub fn chroot(&self) -> Option<&ChrootPrefix> {
        self.chroot.as_ref()
    }
}

fn parse_host(entry: &str, input: &str) -> Result<HostPort, ConfigError> {
    let bad = |reason: String| ConfigError::ConnectString {
        input: input.to_string(),
        reason,
    };
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| bad(format!("invalid port '{}'", port)))
    };

    let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| bad(format!("unterminated IPv6 literal '{}'", entry)))?;
        match tail {
            "" => (host, DEFAULT_PORT),
            _ => match tail.strip_prefix(':') {
                Some(port) => (host, parse_port(port)?),
                None => return Err(bad(format!("unexpected '{}' after IPv6 literal", tail))),
            },
        }
    } else {
        match entry.split_once(':') {
            None => (entry, DEFAULT_PORT),
            Some((_, port)) if port.contains(':') => {
                return Err(bad(format!("IPv6 address '{}' must be bracketed", entry)));
            }
            Some((host, port)) => (host, parse_port(port)?),
        }
    };

    if host.is_empty() {
        return Err(bad(format!("empty host in '{}'", entry)));
    }
    Ok(HostPort {
        host: host.to_string(),
        port,
    })
}

impl FromStr for ConnectString {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let (hosts_part, chroot) = match input.find('/') {
            Some(idx) => (&input[..idx], Some(&input[idx..])),
            None => (input, None),
        };

        let hosts = hosts_part
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| parse_host(h, input))
            .collect::<Result<Vec<_>, _>>()?;
        if hosts.is_empty() {
            return Err(ConfigError::ConnectString {
                input: input.to_string(),
                reason: "no hosts".to_string(),
            });
        }

        Ok(Self {
            hosts,
            chroot: ChrootPrefix::parse_optional(chroot)?,
        })
    }
}

impl fmt::Display for ConnectString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, host) in self.hosts.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", host)?;
        }
        if let Some(chroot) = &self.chroot {
            write!(f, "{}", chroot)?;
        }
        Ok(())
    }
}

fn default_exempt_paths() -> Vec<String> {
    vec![CONFIG_NODE.to_string()]
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

/// Settings for one chrooted session
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConfig {
    pub connect_string: String,

    /// Overrides the chroot suffix of `connect-string`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chroot: Option<String>,

    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl SessionConfig {
    pub fn builder(connect_string: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            connect_string: connect_string.into(),
            chroot: None,
            exempt_paths: default_exempt_paths(),
            response_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            logging: None,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        for path in &self.exempt_paths {
            validate_path(path, false).map_err(|e| ZkError::InvalidPath {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }
        self.chroot_prefix().map(|_| ())
    }

    pub fn parsed_connect_string(&self) -> Result<ConnectString, ConfigError> {
        self.connect_string.parse()
    }

    /// Effective chroot: the explicit `chroot` key wins over the connect string.
    pub fn chroot_prefix(&self) -> Result<Option<ChrootPrefix>, ConfigError> {
        let connect = self.parsed_connect_string()?;
        match &self.chroot {
            Some(explicit) => Ok(ChrootPrefix::parse_optional(Some(explicit.as_str()))?),
            None => Ok(connect.chroot),
        }
    }

    pub fn translator(&self) -> Result<PathTranslator, ConfigError> {
        Ok(PathTranslator::new(
            self.chroot_prefix()?,
            self.exempt_paths.iter().cloned(),
        ))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Install the subscriber described by the `[logging]` section, if any.
    ///
    /// Returns whether a subscriber was installed.
    pub fn init_logging(&self, component: &str) -> anyhow::Result<bool> {
        match &self.logging {
            Some(logging) => {
                logging.init(component)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Builder for [`SessionConfig`].
pub struct SessionConfigBuilder {
    connect_string: String,
    chroot: Option<String>,
    exempt_paths: Vec<String>,
    response_timeout: Duration,
    logging: Option<LoggingConfig>,
}

impl SessionConfigBuilder {
    pub fn chroot(mut self, chroot: impl Into<String>) -> Self {
        self.chroot = Some(chroot.into());
        self
    }

    /// Replace the exempt set (defaults to the config node alone).
    pub fn exempt_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let config = SessionConfig {
            connect_string: self.connect_string,
            chroot: self.chroot,
            exempt_paths: self.exempt_paths,
            response_timeout_ms: u64::try_from(self.response_timeout.as_millis()).unwrap_or(u64::MAX),
            logging: self.logging,
        };
        config.validate()?;
        Ok(config)
    }
}
