// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ordered delivery of watch events and asynchronous completions.
//!
//! One task per session consumes the raw event stream together with a job
//! queue fed by the session itself (completions and locally synthesized
//! state events). Server events already queued are always drained before
//! the next job, so a completion never overtakes an event that reached the
//! connection ahead of its response. Watches supplied with a read are
//! activated through the same queue once the read has succeeded, so they
//! only see events that follow the read.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use keeper_proto::{KeeperState, WatcherEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::connection::EventStream;
use crate::path::PathTranslator;
use crate::watch::{PendingWatch, WatchRegistry, WatchedEvent, Watcher};

/// Work accepted by the dispatcher task besides raw events
pub(crate) enum DispatchItem {
    /// Locally synthesized event
    Event(WatcherEvent),
    Register(PendingWatch),
    Completion(Box<dyn FnOnce() + Send>),
    Shutdown,
}

pub struct EventDispatcher {
    translator: Arc<PathTranslator>,
    registry: Arc<WatchRegistry>,
    default_watcher: Option<Arc<dyn Watcher>>,
    last_state: Mutex<Option<KeeperState>>,
}

impl EventDispatcher {
    pub fn new(
        translator: Arc<PathTranslator>,
        registry: Arc<WatchRegistry>,
        default_watcher: Option<Arc<dyn Watcher>>,
    ) -> Self {
        Self {
            translator,
            registry,
            default_watcher,
            last_state: Mutex::new(None),
        }
    }

    /// Deliver a single server event; returns how many watchers were invoked.
    pub fn dispatch(&self, event: WatcherEvent) -> usize {
        if event.is_session_event() {
            return self.dispatch_state(event.state);
        }

        let Some(server_path) = event.path.as_deref() else {
            warn!(event_type = ?event.event_type, "node event without a path");
            return 0;
        };
        let client_path = match self.translator.to_client_checked(server_path) {
            Ok(path) => path,
            Err(err) => {
                warn!(%err, event_type = ?event.event_type, "dropping watch event");
                return 0;
            }
        };

        let watchers = self.registry.take_matching(server_path, event.event_type);
        trace!(
            server_path,
            client_path = %client_path,
            event_type = ?event.event_type,
            watchers = watchers.len(),
            "dispatching node event"
        );

        let delivered = WatchedEvent {
            event_type: event.event_type,
            state: event.state,
            path: Some(client_path),
        };
        for watcher in &watchers {
            deliver(watcher, &delivered);
        }
        watchers.len()
    }

    /// Deliver an event synthesized by the session.
    ///
    /// A state event repeating the last delivered state is skipped, so a
    /// failed request does not echo a transition the server already reported.
    fn dispatch_injected(&self, event: WatcherEvent) -> usize {
        if event.is_session_event() && *self.lock_last_state() == Some(event.state) {
            trace!(state = ?event.state, "suppressing repeated state event");
            return 0;
        }
        self.dispatch(event)
    }

    fn lock_last_state(&self) -> std::sync::MutexGuard<'_, Option<KeeperState>> {
        self.last_state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn dispatch_state(&self, state: KeeperState) -> usize {
        *self.lock_last_state() = Some(state);

        let mut targets: Vec<Arc<dyn Watcher>> = Vec::new();
        for watcher in self.default_watcher.iter().cloned().chain(self.registry.all_watchers()) {
            if !targets.iter().any(|t| same_watcher(t, &watcher)) {
                targets.push(watcher);
            }
        }

        debug!(?state, watchers = targets.len(), "session state changed");
        let event = WatchedEvent::session(state);
        for watcher in &targets {
            deliver(watcher, &event);
        }

        if state.is_terminal() {
            let dropped = self.registry.drop_all();
            debug!(?state, dropped, "dropped pending watches");
        }
        targets.len()
    }

    /// Run the dispatcher on the current tokio runtime
    pub(crate) fn spawn(self, events: EventStream) -> DispatcherHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(events, rx));
        DispatcherHandle {
            queue: DispatchQueue { tx },
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(self, mut events: EventStream, mut jobs: mpsc::UnboundedReceiver<DispatchItem>) {
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;

                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        self.dispatch(event);
                    }
                    None => {
                        debug!("event stream ended");
                        events_open = false;
                    }
                },
                item = jobs.recv() => match item {
                    Some(DispatchItem::Event(event)) => {
                        self.dispatch_injected(event);
                    }
                    Some(DispatchItem::Register(watch)) => {
                        let (path, kind) = (watch.server_path.clone(), watch.kind);
                        let id = watch.activate(&self.registry);
                        trace!(server_path = %path, ?kind, id = id.0, "watch activated");
                    }
                    Some(DispatchItem::Completion(complete)) => {
                        if panic::catch_unwind(AssertUnwindSafe(complete)).is_err() {
                            warn!("completion callback panicked");
                        }
                    }
                    Some(DispatchItem::Shutdown) | None => break,
                },
            }
        }
        debug!("dispatcher stopped");
    }
}

fn same_watcher(a: &Arc<dyn Watcher>, b: &Arc<dyn Watcher>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn deliver(watcher: &Arc<dyn Watcher>, event: &WatchedEvent) {
    if panic::catch_unwind(AssertUnwindSafe(|| watcher.handle(event))).is_err() {
        warn!(
            path = ?event.path,
            event_type = ?event.event_type,
            "watcher panicked"
        );
    }
}

/// Cloneable sending side of a dispatcher
#[derive(Clone)]
pub(crate) struct DispatchQueue {
    tx: mpsc::UnboundedSender<DispatchItem>,
}

impl DispatchQueue {
    /// Queue a completion behind every event received so far.
    ///
    /// Once the dispatcher has stopped the completion runs inline instead,
    /// and `false` is returned.
    pub(crate) fn complete(&self, f: impl FnOnce() + Send + 'static) -> bool {
        match self.tx.send(DispatchItem::Completion(Box::new(f))) {
            Ok(()) => true,
            Err(mpsc::error::SendError(DispatchItem::Completion(f))) => {
                f();
                false
            }
            Err(_) => false,
        }
    }

    /// Queue a locally synthesized event
    pub(crate) fn inject(&self, event: WatcherEvent) -> bool {
        self.tx.send(DispatchItem::Event(event)).is_ok()
    }

    /// Activate a watch behind every event received so far.
    ///
    /// The watch is discarded if the dispatcher has stopped.
    pub(crate) fn register(&self, watch: PendingWatch) -> bool {
        self.tx.send(DispatchItem::Register(watch)).is_ok()
    }
}

/// Owning handle of a running dispatcher
pub(crate) struct DispatcherHandle {
    queue: DispatchQueue,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherHandle {
    pub(crate) fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub(crate) fn complete(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.queue.complete(f)
    }

    pub(crate) fn inject(&self, event: WatcherEvent) -> bool {
        self.queue.inject(event)
    }

    /// Stop after the queued work and wait for the task to finish
    pub(crate) async fn shutdown(&self) {
        let _ = self.queue.tx.send(DispatchItem::Shutdown);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "dispatcher task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ChrootPrefix;
    use crate::watchers::EventQueue;
    use keeper_proto::{CONFIG_NODE, EventType, WatchMode, WatcherKind};
    use std::time::Duration;

    fn setup(default: Option<Arc<dyn Watcher>>) -> (Arc<WatchRegistry>, EventDispatcher) {
        let translator = Arc::new(PathTranslator::with_chroot(ChrootPrefix::new("/ch1").unwrap()));
        let registry = Arc::new(WatchRegistry::new());
        let dispatcher = EventDispatcher::new(translator, registry.clone(), default);
        (registry, dispatcher)
    }

    #[test]
    fn node_event_is_translated_and_consumed() {
        let (registry, dispatcher) = setup(None);
        let queue = EventQueue::new();
        registry.register("/ch1/ch2", WatcherKind::Exist, queue.watcher(), WatchMode::OneShot);

        let event = WatcherEvent::node(EventType::NodeDataChanged, "/ch1/ch2");
        assert_eq!(dispatcher.dispatch(event.clone()), 1);
        assert_eq!(dispatcher.dispatch(event), 0);

        let got = queue.try_recv().unwrap();
        assert_eq!(got.path.as_deref(), Some("/ch2"));
        assert_eq!(got.event_type, EventType::NodeDataChanged);
        assert!(queue.is_empty());
    }

    #[test]
    fn foreign_events_are_dropped() {
        let (registry, dispatcher) = setup(None);
        let queue = EventQueue::new();
        registry.register("/other", WatcherKind::Data, queue.watcher(), WatchMode::OneShot);

        assert_eq!(
            dispatcher.dispatch(WatcherEvent::node(EventType::NodeDataChanged, "/other")),
            0
        );
        assert!(queue.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn exempt_config_path_is_delivered_untranslated() {
        let (registry, dispatcher) = setup(None);
        let queue = EventQueue::new();
        registry.register(CONFIG_NODE, WatcherKind::Data, queue.watcher(), WatchMode::Persistent);

        for _ in 0..2 {
            dispatcher.dispatch(WatcherEvent::node(EventType::NodeDataChanged, CONFIG_NODE));
        }
        let events = queue.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.path.as_deref() == Some(CONFIG_NODE)));
    }

    #[test]
    fn state_events_broadcast_without_consuming() {
        let default = EventQueue::new();
        let (registry, dispatcher) = setup(Some(default.watcher()));
        let watcher = EventQueue::new();
        registry.register("/ch1/a", WatcherKind::Data, watcher.watcher(), WatchMode::OneShot);

        assert_eq!(dispatcher.dispatch(WatcherEvent::session(KeeperState::Disconnected)), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(default.len(), 1);
        assert_eq!(watcher.try_recv().unwrap().state, KeeperState::Disconnected);

        dispatcher.dispatch(WatcherEvent::session(KeeperState::Expired));
        assert!(registry.is_empty());
        assert_eq!(watcher.try_recv().unwrap().state, KeeperState::Expired);
    }

    #[test]
    fn server_state_events_repeat_but_injected_repeats_are_skipped() {
        let default = EventQueue::new();
        let (_, dispatcher) = setup(Some(default.watcher()));

        assert_eq!(dispatcher.dispatch(WatcherEvent::session(KeeperState::Disconnected)), 1);
        assert_eq!(dispatcher.dispatch(WatcherEvent::session(KeeperState::Disconnected)), 1);
        assert_eq!(
            dispatcher.dispatch_injected(WatcherEvent::session(KeeperState::Disconnected)),
            0
        );
        assert_eq!(
            dispatcher.dispatch_injected(WatcherEvent::session(KeeperState::SyncConnected)),
            1
        );
        // the server's own report is delivered even after the injected one
        assert_eq!(dispatcher.dispatch(WatcherEvent::session(KeeperState::SyncConnected)), 1);

        let states: Vec<_> = default.drain().into_iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                KeeperState::Disconnected,
                KeeperState::Disconnected,
                KeeperState::SyncConnected,
                KeeperState::SyncConnected,
            ]
        );
    }

    #[test]
    fn default_watcher_registered_twice_hears_state_once() {
        let default = EventQueue::new();
        let shared = default.watcher();
        let (registry, dispatcher) = setup(Some(shared.clone()));
        registry.register("/ch1/a", WatcherKind::Data, shared, WatchMode::OneShot);

        assert_eq!(dispatcher.dispatch(WatcherEvent::session(KeeperState::SyncConnected)), 1);
        assert_eq!(default.len(), 1);
    }

    #[test]
    fn panicking_watcher_does_not_stop_delivery() {
        let (registry, dispatcher) = setup(None);
        let queue = EventQueue::new();
        let bad: Arc<dyn Watcher> = Arc::new(|_: &WatchedEvent| panic!("boom"));
        registry.register("/ch1/a", WatcherKind::Data, bad, WatchMode::OneShot);
        registry.register("/ch1/a", WatcherKind::Data, queue.watcher(), WatchMode::OneShot);

        assert_eq!(
            dispatcher.dispatch(WatcherEvent::node(EventType::NodeDeleted, "/ch1/a")),
            2
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn reregistration_inside_callback_waits_for_next_event() {
        let (registry, dispatcher) = setup(None);
        let queue = EventQueue::new();
        let reg = registry.clone();
        let sink = queue.watcher();
        let rearm: Arc<dyn Watcher> = Arc::new(move |e: &WatchedEvent| {
            sink.handle(e);
            reg.register("/ch1/a", WatcherKind::Data, sink.clone(), WatchMode::OneShot);
        });
        registry.register("/ch1/a", WatcherKind::Data, rearm, WatchMode::OneShot);

        dispatcher.dispatch(WatcherEvent::node(EventType::NodeDataChanged, "/ch1/a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(registry.len(), 1);
        dispatcher.dispatch(WatcherEvent::node(EventType::NodeDataChanged, "/ch1/a"));
        assert_eq!(queue.len(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn queued_events_precede_completions() {
        let (registry, dispatcher) = setup(None);
        let order = EventQueue::new();
        registry.register("/ch1/p1", WatcherKind::Data, order.watcher(), WatchMode::OneShot);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        events_tx
            .send(WatcherEvent::node(EventType::NodeDataChanged, "/ch1/p1"))
            .unwrap();
        let handle = dispatcher.spawn(events_rx);

        let sink = order.clone();
        handle.complete(move || {
            sink.handle(&WatchedEvent::session(KeeperState::SyncConnected));
        });

        let first = order.recv_timeout(Duration::from_secs(1)).await.unwrap();
        let second = order.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.path.as_deref(), Some("/p1"));
        assert_eq!(second.event_type, EventType::None);

        handle.shutdown().await;
        assert!(!handle.inject(WatcherEvent::session(KeeperState::Closed)));
    }

    #[tokio::test]
    async fn registration_lands_after_earlier_events() {
        let (registry, dispatcher) = setup(None);
        let queue = EventQueue::new();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        events_tx
            .send(WatcherEvent::node(EventType::NodeDataChanged, "/ch1/p"))
            .unwrap();
        let handle = dispatcher.spawn(events_rx);
        handle.queue().register(PendingWatch {
            server_path: "/ch1/p".into(),
            kind: WatcherKind::Data,
            mode: WatchMode::OneShot,
            watcher: queue.watcher(),
        });
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        handle.complete(move || {
            let _ = done_tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(queue.is_empty());
        assert_eq!(registry.len(), 1);

        events_tx
            .send(WatcherEvent::node(EventType::NodeDataChanged, "/ch1/p"))
            .unwrap();
        let event = queue.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.path.as_deref(), Some("/p"));

        handle.shutdown().await;
        let discarded = PendingWatch {
            server_path: "/ch1/q".into(),
            kind: WatcherKind::Data,
            mode: WatchMode::OneShot,
            watcher: queue.watcher(),
        };
        assert!(!handle.queue().register(discarded));
        assert_eq!(registry.len(), 0);
    }
}
