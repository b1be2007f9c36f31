// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the client namespace layer

/// Client error type.
///
/// Path-carrying variants hold a server-space path while inside the raw
/// connection and a client-space path once surfaced by [`crate::ChrootSession`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ZkError {
    #[error("no node for {path}")]
    NotFound { path: String },
    #[error("node already exists: {path}")]
    NodeExists { path: String },
    #[error("node has children: {path}")]
    NotEmpty { path: String },
    #[error("version conflict for {path}")]
    VersionConflict { path: String },
    #[error("ephemeral nodes may not have children: {path}")]
    NoChildrenForEphemerals { path: String },
    #[error("not authorized for {path}")]
    NoAuth { path: String },
    #[error("authentication failed")]
    AuthFailed,
    #[error("connection loss")]
    ConnectionLoss,
    #[error("session expired")]
    SessionExpired,
    #[error("session closed")]
    SessionClosed,
    #[error("operation timed out")]
    OperationTimeout,
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("unexpected response to {op}")]
    UnexpectedResponse { op: &'static str },
    #[error("server path {path} is outside this session's namespace")]
    TranslationMismatch { path: String },
}

impl ZkError {
    pub fn path(&self) -> Option<&str> {
        match self {
            ZkError::NotFound { path }
            | ZkError::NodeExists { path }
            | ZkError::NotEmpty { path }
            | ZkError::VersionConflict { path }
            | ZkError::NoChildrenForEphemerals { path }
            | ZkError::NoAuth { path }
            | ZkError::InvalidPath { path, .. }
            | ZkError::TranslationMismatch { path } => Some(path),
            _ => None,
        }
    }

    /// Rewrite the carried path, if any
    pub fn map_path(mut self, f: impl FnOnce(String) -> String) -> Self {
        match &mut self {
            ZkError::NotFound { path }
            | ZkError::NodeExists { path }
            | ZkError::NotEmpty { path }
            | ZkError::VersionConflict { path }
            | ZkError::NoChildrenForEphemerals { path }
            | ZkError::NoAuth { path }
            | ZkError::InvalidPath { path, .. }
            | ZkError::TranslationMismatch { path } => {
                *path = f(std::mem::take(path));
            }
            _ => {}
        }
        self
    }

    /// Transient; the same operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ZkError::ConnectionLoss)
    }

    /// The session and all its watches are void.
    pub fn is_session_terminal(&self) -> bool {
        matches!(self, ZkError::SessionExpired | ZkError::SessionClosed)
    }
}

pub type ZkResult<T> = Result<T, ZkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_path_touches_only_path_variants() {
        let err = ZkError::NotFound {
            path: "/app/ch3".into(),
        }
        .map_path(|p| p.trim_start_matches("/app").to_string());
        assert_eq!(err.path(), Some("/ch3"));

        let err = ZkError::ConnectionLoss.map_path(|_| unreachable!());
        assert_eq!(err, ZkError::ConnectionLoss);
    }

    #[test]
    fn classification() {
        assert!(ZkError::ConnectionLoss.is_retryable());
        assert!(!ZkError::SessionExpired.is_retryable());
        assert!(ZkError::SessionExpired.is_session_terminal());
        assert!(ZkError::SessionClosed.is_session_terminal());
        assert!(!ZkError::AuthFailed.is_session_terminal());
    }

    #[test]
    fn display_includes_path() {
        let err = ZkError::VersionConflict { path: "/a".into() };
        assert_eq!(err.to_string(), "version conflict for /a");
    }
}
