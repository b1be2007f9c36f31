// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path and request validation

use crate::messages::Request;
use thiserror::Error;

/// Validation error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("path must not be empty")]
    Empty,
    #[error("path must start with '/'")]
    NotAbsolute,
    #[error("path must not end with '/'")]
    TrailingSlash,
    #[error("empty node name at byte {0}")]
    EmptySegment(usize),
    #[error("relative path segment '{0}' not allowed")]
    RelativeSegment(String),
    #[error("invalid character {ch:?} at byte {index}")]
    InvalidChar { ch: char, index: usize },
}

fn is_forbidden(ch: char) -> bool {
    let c = ch as u32;
    c == 0
        || (0x01..=0x1f).contains(&c)
        || (0x7f..=0x9f).contains(&c)
        || (0xd800..=0xf8ff).contains(&c)
        || (0xfff0..=0xffff).contains(&c)
}

/// Validate an absolute node path.
///
/// `sequential` allows a trailing `/`, since the server appends the sequence
/// suffix to the supplied name.
pub fn validate_path(path: &str, sequential: bool) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::Empty);
    }
    if !path.starts_with('/') {
        return Err(ValidationError::NotAbsolute);
    }
    if path.len() == 1 {
        return Ok(());
    }

    let body = match path.strip_suffix('/') {
        Some(stripped) if sequential => stripped,
        Some(_) => return Err(ValidationError::TrailingSlash),
        None => path,
    };

    let mut offset = 1;
    for segment in body[1..].split('/') {
        if segment.is_empty() {
            return Err(ValidationError::EmptySegment(offset));
        }
        if segment == "." || segment == ".." {
            return Err(ValidationError::RelativeSegment(segment.to_string()));
        }
        if let Some((i, ch)) = segment.char_indices().find(|(_, ch)| is_forbidden(*ch)) {
            return Err(ValidationError::InvalidChar {
                ch,
                index: offset + i,
            });
        }
        offset += segment.len() + 1;
    }
    Ok(())
}

/// Validate every path a request carries
pub fn validate_request(request: &Request) -> Result<(), ValidationError> {
    match request {
        Request::Create { path, mode, .. } => validate_path(path, mode.is_sequential()),
        Request::Delete { path, .. }
        | Request::Exists { path, .. }
        | Request::GetData { path, .. }
        | Request::SetData { path, .. }
        | Request::GetChildren { path, .. }
        | Request::RemoveWatches { path, .. }
        | Request::Sync { path } => validate_path(path, false),
        Request::AddAuth { .. } | Request::CloseSession => Ok(()),
    }
}
