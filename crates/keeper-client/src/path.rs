// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Client/server path translation under a chroot prefix

use std::collections::BTreeSet;
use std::fmt;

use keeper_proto::{CONFIG_NODE, validate_path};

use crate::error::{ZkError, ZkResult};

/// Paths that bypass the chroot rewrite unless configured otherwise
pub const DEFAULT_EXEMPT_PATHS: &[&str] = &[CONFIG_NODE];

/// Normalized absolute subtree a session treats as its root.
///
/// Never `/` and never ends with a separator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChrootPrefix(String);

impl ChrootPrefix {
    pub fn new(prefix: impl Into<String>) -> ZkResult<Self> {
        let prefix = prefix.into();
        if prefix == "/" {
            return Err(ZkError::InvalidPath {
                path: prefix,
                reason: "a chroot of '/' is no chroot".to_string(),
            });
        }
        validate_path(&prefix, false).map_err(|e| ZkError::InvalidPath {
            reason: e.to_string(),
            path: prefix.clone(),
        })?;
        Ok(Self(prefix))
    }

    /// `None` for an absent or root chroot
    pub fn parse_optional(prefix: Option<&str>) -> ZkResult<Option<Self>> {
        match prefix {
            None | Some("") | Some("/") => Ok(None),
            Some(p) => Self::new(p).map(Some),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChrootPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pure mapping between client-visible and server-visible paths
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathTranslator {
    chroot: Option<ChrootPrefix>,
    exempt: BTreeSet<String>,
}

impl Default for PathTranslator {
    fn default() -> Self {
        Self::new(None, DEFAULT_EXEMPT_PATHS.iter().copied())
    }
}

impl PathTranslator {
    pub fn new<I, S>(chroot: Option<ChrootPrefix>, exempt: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chroot,
            exempt: exempt.into_iter().map(Into::into).collect(),
        }
    }

    /// Translator for `chroot` with the default exempt set
    pub fn with_chroot(chroot: ChrootPrefix) -> Self {
        Self::new(Some(chroot), DEFAULT_EXEMPT_PATHS.iter().copied())
    }

    /// Add `path` to the exempt set
    pub fn exempting(mut self, path: impl Into<String>) -> Self {
        self.exempt.insert(path.into());
        self
    }

    pub fn chroot(&self) -> Option<&ChrootPrefix> {
        self.chroot.as_ref()
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt.contains(path)
    }

    pub fn exempt_paths(&self) -> impl Iterator<Item = &str> {
        self.exempt.iter().map(String::as_str)
    }

    pub fn to_server(&self, client_path: &str) -> String {
        let Some(chroot) = &self.chroot else {
            return client_path.to_string();
        };
        if self.is_exempt(client_path) {
            return client_path.to_string();
        }
        if client_path == "/" {
            return chroot.0.clone();
        }
        format!("{}{}", chroot.0, client_path)
    }

    /// Strip the chroot from a server path.
    ///
    /// `None` means the path lies outside this session's namespace.
    pub fn to_client(&self, server_path: &str) -> Option<String> {
        let Some(chroot) = &self.chroot else {
            return Some(server_path.to_string());
        };
        if self.is_exempt(server_path) {
            return Some(server_path.to_string());
        }
        let rest = server_path.strip_prefix(chroot.as_str())?;
        if rest.is_empty() {
            Some("/".to_string())
        } else if rest.starts_with('/') {
            Some(rest.to_string())
        } else {
            None
        }
    }

    /// Like [`Self::to_client`] but reports a mismatch as an error
    pub fn to_client_checked(&self, server_path: &str) -> ZkResult<String> {
        self.to_client(server_path)
            .ok_or_else(|| ZkError::TranslationMismatch {
                path: server_path.to_string(),
            })
    }
}
