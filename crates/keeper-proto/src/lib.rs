// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Keeper protocol: request/response types and path validation
//!
//! This crate defines the messages exchanged between the client namespace
//! layer and a raw ensemble connection. It performs no I/O; encoding these
//! types onto a wire is the connection's business.

pub mod messages;
pub mod validation;

// Re-export key types
pub use messages::{
    ANY_VERSION, Acl, CONFIG_NODE, CreateMode, EventType, Id, KeeperState, Perms, Request,
    Response, Stat, WatchMode, WatcherEvent, WatcherKind,
};
pub use validation::*;
