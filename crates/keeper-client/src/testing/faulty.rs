// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault-injecting connection decorator
//!
//! Wraps any [`RawConnection`] and fails selected requests according to a
//! [`FailureBehavior`] policy, so retry and session-state handling can be
//! exercised without a misbehaving server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use keeper_proto::{Request, Response};
use tracing::debug;

use crate::connection::{EventStream, RawConnection, SessionState};
use crate::error::{ZkError, ZkResult};

/// Custom predicate: receives (operation name, zero-based call index) and
/// returns `Some(error)` to fail the call
pub type FaultPredicate = Arc<dyn Fn(&str, u64) -> Option<ZkError> + Send + Sync>;

/// Which requests fail, keyed by [`Request::op_name`]
#[derive(Default)]
pub enum FailureBehavior {
    /// Never fail
    #[default]
    AlwaysSucceed,

    /// Fail after N successful calls to an operation
    /// Example: FailAfter { op: "set_data", count: 2, .. } fails from the 3rd set_data on
    FailAfter {
        op: &'static str,
        count: u64,
        error: ZkError,
    },

    /// Fail the first N calls to an operation
    FailFor {
        op: &'static str,
        count: u64,
        error: ZkError,
    },

    /// Always fail an operation
    AlwaysFail { op: &'static str, error: ZkError },

    Custom(FaultPredicate),
}

pub struct FaultyConnection {
    inner: Arc<dyn RawConnection>,
    behavior: Mutex<FailureBehavior>,
    call_counts: Mutex<HashMap<String, u64>>,
}

impl FaultyConnection {
    /// Wrap `inner` without failing anything yet
    pub fn new(inner: Arc<dyn RawConnection>) -> Self {
        Self::with_behavior(inner, FailureBehavior::AlwaysSucceed)
    }

    pub fn with_behavior(inner: Arc<dyn RawConnection>, behavior: FailureBehavior) -> Self {
        Self {
            inner,
            behavior: Mutex::new(behavior),
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Update the failure behavior at runtime
    pub fn set_behavior(&self, behavior: FailureBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// Number of times an operation has been attempted, failures included
    pub fn call_count(&self, op: &str) -> u64 {
        lock(&self.call_counts).get(op).copied().unwrap_or(0)
    }

    pub fn reset_counters(&self) {
        lock(&self.call_counts).clear();
    }

    fn check_fault(&self, op: &str) -> ZkResult<()> {
        let call_index = {
            let mut counts = lock(&self.call_counts);
            let counter = counts.entry(op.to_string()).or_insert(0);
            let index = *counter;
            *counter += 1;
            index
        };

        let injected = match &*lock(&self.behavior) {
            FailureBehavior::AlwaysSucceed => None,
            FailureBehavior::FailAfter {
                op: target,
                count,
                error,
            } if *target == op && call_index >= *count => Some(error.clone()),
            FailureBehavior::FailFor {
                op: target,
                count,
                error,
            } if *target == op && call_index < *count => Some(error.clone()),
            FailureBehavior::AlwaysFail { op: target, error } if *target == op => {
                Some(error.clone())
            }
            FailureBehavior::Custom(predicate) => predicate(op, call_index),
            _ => None,
        };

        match injected {
            Some(err) => {
                debug!(op, call_index, %err, "injecting fault");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RawConnection for FaultyConnection {
    fn session_id(&self) -> i64 {
        self.inner.session_id()
    }

    async fn send(&self, request: Request) -> ZkResult<Response> {
        self.check_fault(request.op_name())?;
        self.inner.send(request).await
    }

    fn subscribe_events(&self) -> Option<EventStream> {
        self.inner.subscribe_events()
    }

    fn session_state(&self) -> SessionState {
        self.inner.session_state()
    }
}
