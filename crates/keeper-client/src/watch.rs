// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Watch registrations keyed by server path and kind

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use keeper_proto::{EventType, KeeperState, WatchMode, WatcherKind};

/// Event as seen by application code, with a client-space path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: KeeperState,
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn session(state: KeeperState) -> Self {
        Self {
            event_type: EventType::None,
            state,
            path: None,
        }
    }
}

/// Callback invoked once per delivered event
pub trait Watcher: Send + Sync {
    fn handle(&self, event: &WatchedEvent);
}

impl<F> Watcher for F
where
    F: Fn(&WatchedEvent) + Send + Sync,
{
    fn handle(&self, event: &WatchedEvent) {
        self(event)
    }
}

/// Opaque registration identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// Watch carried alongside a read until the read succeeds
pub(crate) struct PendingWatch {
    pub(crate) server_path: String,
    pub(crate) kind: WatcherKind,
    pub(crate) mode: WatchMode,
    pub(crate) watcher: Arc<dyn Watcher>,
}

impl PendingWatch {
    pub(crate) fn activate(self, registry: &WatchRegistry) -> WatchId {
        registry.register(&self.server_path, self.kind, self.watcher, self.mode)
    }
}

struct WatchEntry {
    id: WatchId,
    kind: WatcherKind,
    mode: WatchMode,
    watcher: Arc<dyn Watcher>,
}

/// Pending one-shot and persistent watches for one session.
///
/// Entries for the same path and kind are kept in registration order and
/// are never deduplicated: each registration is its own delivery contract.
/// Callers receive watcher handles and invoke them after the lock is
/// released.
#[derive(Default)]
pub struct WatchRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<String, Vec<WatchEntry>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<WatchEntry>>> {
        // Callbacks never run under this lock, so a poisoned guard still
        // holds consistent data.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(
        &self,
        server_path: &str,
        kind: WatcherKind,
        watcher: Arc<dyn Watcher>,
        mode: WatchMode,
    ) -> WatchId {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().entry(server_path.to_string()).or_default().push(WatchEntry {
            id,
            kind,
            mode,
            watcher,
        });
        id
    }

    /// Remove a single registration; returns whether it was still pending
    pub fn unregister(&self, server_path: &str, id: WatchId) -> bool {
        let mut entries = self.lock();
        let Some(list) = entries.get_mut(server_path) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| e.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.remove(server_path);
        }
        removed
    }

    /// Remove every registration of `kind` (or all kinds for `Any`)
    pub fn remove_kind(&self, server_path: &str, kind: WatcherKind) -> usize {
        let mut entries = self.lock();
        let Some(list) = entries.get_mut(server_path) else {
            return 0;
        };
        let before = list.len();
        list.retain(|e| !kind.covers(e.kind));
        let removed = before - list.len();
        if list.is_empty() {
            entries.remove(server_path);
        }
        removed
    }

    /// Watchers matching a node event, in registration order.
    ///
    /// One-shot matches are removed; persistent matches stay registered.
    pub fn take_matching(&self, server_path: &str, event_type: EventType) -> Vec<Arc<dyn Watcher>> {
        let kinds = WatcherKind::triggered_by(event_type);
        if kinds.is_empty() {
            return Vec::new();
        }

        let mut entries = self.lock();
        let Some(list) = entries.get_mut(server_path) else {
            return Vec::new();
        };

        let mut matched = Vec::new();
        list.retain(|e| {
            if !kinds.contains(&e.kind) {
                return true;
            }
            matched.push(e.watcher.clone());
            e.mode == WatchMode::Persistent
        });
        if list.is_empty() {
            entries.remove(server_path);
        }
        matched
    }

    /// Every registered watcher, without removing any
    pub fn all_watchers(&self) -> Vec<Arc<dyn Watcher>> {
        let entries = self.lock();
        let mut all: Vec<(WatchId, Arc<dyn Watcher>)> = entries
            .values()
            .flatten()
            .map(|e| (e.id, e.watcher.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all.into_iter().map(|(_, w)| w).collect()
    }

    pub fn contains(&self, server_path: &str, kind: WatcherKind) -> bool {
        self.lock()
            .get(server_path)
            .is_some_and(|list| list.iter().any(|e| kind.covers(e.kind)))
    }

    /// Drop everything; returns how many entries were discarded
    pub fn drop_all(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.values().map(Vec::len).sum();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn Watcher>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let w: Arc<dyn Watcher> = Arc::new(move |_: &WatchedEvent| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (hits, w)
    }

    #[test]
    fn one_shot_entries_are_taken_once() {
        let reg = WatchRegistry::new();
        let (_, w) = counter();
        reg.register("/a", WatcherKind::Exist, w, WatchMode::OneShot);

        assert_eq!(reg.take_matching("/a", EventType::NodeCreated).len(), 1);
        assert!(reg.take_matching("/a", EventType::NodeDeleted).is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn persistent_entries_survive_delivery() {
        let reg = WatchRegistry::new();
        let (_, w) = counter();
        reg.register("/cfg", WatcherKind::Data, w, WatchMode::Persistent);

        for _ in 0..3 {
            assert_eq!(reg.take_matching("/cfg", EventType::NodeDataChanged).len(), 1);
        }
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_registrations_are_all_delivered() {
        let reg = WatchRegistry::new();
        let (_, w) = counter();
        reg.register("/a", WatcherKind::Data, w.clone(), WatchMode::OneShot);
        reg.register("/a", WatcherKind::Data, w, WatchMode::OneShot);

        assert_eq!(reg.take_matching("/a", EventType::NodeDataChanged).len(), 2);
    }

    #[test]
    fn kinds_filter_by_event_type() {
        let reg = WatchRegistry::new();
        let (_, w) = counter();
        reg.register("/a", WatcherKind::Child, w.clone(), WatchMode::OneShot);
        reg.register("/a", WatcherKind::Data, w, WatchMode::OneShot);

        assert!(reg.take_matching("/a", EventType::None).is_empty());
        assert_eq!(reg.take_matching("/a", EventType::NodeChildrenChanged).len(), 1);
        assert!(reg.contains("/a", WatcherKind::Data));
        assert!(!reg.contains("/a", WatcherKind::Child));
        assert_eq!(reg.take_matching("/a", EventType::NodeDeleted).len(), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn unregister_and_remove_kind() {
        let reg = WatchRegistry::new();
        let (_, w) = counter();
        let id = reg.register("/a", WatcherKind::Data, w.clone(), WatchMode::OneShot);
        reg.register("/a", WatcherKind::Child, w.clone(), WatchMode::Persistent);
        reg.register("/a", WatcherKind::Exist, w, WatchMode::OneShot);

        assert!(reg.unregister("/a", id));
        assert!(!reg.unregister("/a", id));
        assert_eq!(reg.remove_kind("/a", WatcherKind::Child), 1);
        assert_eq!(reg.remove_kind("/a", WatcherKind::Any), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn all_watchers_in_registration_order_and_drop_all() {
        let reg = WatchRegistry::new();
        let (_, w1) = counter();
        let (_, w2) = counter();
        reg.register("/z", WatcherKind::Data, w1.clone(), WatchMode::OneShot);
        reg.register("/a", WatcherKind::Data, w2.clone(), WatchMode::Persistent);

        let all = reg.all_watchers();
        assert_eq!(all.len(), 2);
        assert!(Arc::ptr_eq(&all[0], &w1));
        assert!(Arc::ptr_eq(&all[1], &w2));
        assert_eq!(reg.drop_all(), 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn concurrent_registration_loses_nothing() {
        let reg = Arc::new(WatchRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let (_, w) = counter();
                        reg.register(&format!("/n{}", (t + i) % 5), WatcherKind::Data, w, WatchMode::OneShot);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 800);
    }
}
