// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Interface to the raw ensemble connection

use async_trait::async_trait;
use keeper_proto::{Request, Response, WatcherEvent};
use tokio::sync::mpsc;

use crate::error::ZkResult;

/// Ordered stream of server-pushed events, paths in server space
pub type EventStream = mpsc::UnboundedReceiver<WatcherEvent>;

/// Lifecycle of the underlying session as reported by the connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Connected,
    Expired,
    Closed,
}

impl SessionState {
    pub fn is_alive(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

/// A single session with the ensemble.
///
/// Implementations own the wire protocol, handshake and reconnection.
/// Requests and responses use server-space paths; errors returned from
/// [`RawConnection::send`] carry server-space paths as well.
#[async_trait]
pub trait RawConnection: Send + Sync {
    fn session_id(&self) -> i64;

    async fn send(&self, request: Request) -> ZkResult<Response>;

    /// Take the event stream; `None` once it has been taken.
    fn subscribe_events(&self) -> Option<EventStream>;

    fn session_state(&self) -> SessionState;
}
