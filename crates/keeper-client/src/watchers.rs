// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ready-made watchers for awaiting and collecting events

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, watch};

use crate::watch::{WatchedEvent, Watcher};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for a watch event")]
    Timeout,
    #[error("watch was cancelled before it fired")]
    Cancelled,
}

struct SignalInner {
    tx: Mutex<Option<watch::Sender<Option<WatchedEvent>>>>,
    rx: watch::Receiver<Option<WatchedEvent>>,
    fired: AtomicUsize,
}

/// Promise resolved by the first event delivered to it.
///
/// Cloning yields another handle to the same promise.
#[derive(Clone)]
pub struct WatchSignal {
    inner: Arc<SignalInner>,
}

impl Default for WatchSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            inner: Arc::new(SignalInner {
                tx: Mutex::new(Some(tx)),
                rx,
                fired: AtomicUsize::new(0),
            }),
        }
    }

    /// Handle suitable for passing to a session operation
    pub fn watcher(&self) -> Arc<dyn Watcher> {
        Arc::new(self.clone())
    }

    /// Wait for the first event, at most `timeout`
    pub async fn wait(&self, timeout: Duration) -> Result<WatchedEvent, WaitError> {
        let mut rx = self.inner.rx.clone();
        // the borrowed value must be released before `rx` goes out of scope
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Err(_) => Err(WaitError::Timeout),
            Ok(Err(_)) => Err(WaitError::Cancelled),
            Ok(Ok(value)) => (*value).clone().ok_or(WaitError::Cancelled),
        };
        outcome
    }

    /// Resolve pending and future waits with `Cancelled` unless already fired
    pub fn cancel(&self) {
        self.lock_tx().take();
    }

    /// Event already received, if any
    pub fn try_get(&self) -> Option<WatchedEvent> {
        self.inner.rx.borrow().clone()
    }

    /// How many events have been delivered to this signal
    pub fn fire_count(&self) -> usize {
        self.inner.fired.load(Ordering::SeqCst)
    }

    fn lock_tx(&self) -> std::sync::MutexGuard<'_, Option<watch::Sender<Option<WatchedEvent>>>> {
        self.inner.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Watcher for WatchSignal {
    fn handle(&self, event: &WatchedEvent) {
        self.inner.fired.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.lock_tx().as_ref() {
            tx.send_if_modified(|slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(event.clone());
                true
            });
        }
    }
}

struct QueueInner {
    events: Mutex<VecDeque<WatchedEvent>>,
    notify: Notify,
}

/// Ordered collector of every event it is handed
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                events: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn watcher(&self) -> Arc<dyn Watcher> {
        Arc::new(self.clone())
    }

    fn events(&self) -> std::sync::MutexGuard<'_, VecDeque<WatchedEvent>> {
        self.inner.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_recv(&self) -> Option<WatchedEvent> {
        self.events().pop_front()
    }

    /// Next event in delivery order, waiting at most `timeout`
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<WatchedEvent, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            if let Some(event) = self.try_recv() {
                return Ok(event);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_recv().ok_or(WaitError::Timeout);
            }
        }
    }

    /// Take everything queued so far
    pub fn drain(&self) -> Vec<WatchedEvent> {
        self.events().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Watcher for EventQueue {
    fn handle(&self, event: &WatchedEvent) {
        self.events().push_back(event.clone());
        self.inner.notify.notify_one();
    }
}
