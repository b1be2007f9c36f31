// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Delivery guarantees of watches registered through a chrooted session

use std::sync::{Arc, Mutex};
use std::time::Duration;

use keeper_client::testing::InMemoryEnsemble;
use keeper_client::{
    ANY_VERSION, Acl, ChrootPrefix, ChrootSession, CreateMode, EventQueue, EventType,
    PathTranslator, RawConnection, Request, Response, WatchMode, WatchSignal, WatchedEvent,
    Watcher, WatcherKind,
};
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    ensemble: InMemoryEnsemble,
    root: ChrootSession,
    app: ChrootSession,
}

/// Unrooted session plus one chrooted at `/app`
async fn fixture() -> Fixture {
    let ensemble = InMemoryEnsemble::new();
    let root = ChrootSession::open_with_translator(
        ensemble.connect(),
        PathTranslator::default(),
        WAIT,
        None,
    )
    .unwrap();
    root.create("/app", b"", &Acl::open_unsafe(), CreateMode::Persistent)
        .await
        .unwrap();
    let app = ChrootSession::open_with_translator(
        ensemble.connect(),
        PathTranslator::with_chroot(ChrootPrefix::new("/app").unwrap()),
        WAIT,
        None,
    )
    .unwrap();
    Fixture {
        ensemble,
        root,
        app,
    }
}

async fn create(s: &ChrootSession, path: &str) {
    s.create(path, b"", &Acl::open_unsafe(), CreateMode::Persistent)
        .await
        .unwrap();
}

/// Wait until every event already queued for `s` has been dispatched
async fn flush(s: &ChrootSession, marker: &str) {
    let signal = WatchSignal::new();
    s.exists(marker, Some(signal.watcher())).await.unwrap();
    create(s, marker).await;
    signal.wait(WAIT).await.expect("marker watch did not fire");
}

#[tokio::test]
async fn exists_watch_fires_exactly_once() {
    let f = fixture().await;
    let signal = WatchSignal::new();
    assert_eq!(f.app.exists("/p", Some(signal.watcher())).await.unwrap(), None);
    assert_eq!(f.app.watch_count(), 1);

    create(&f.root, "/app/p").await;
    let event = signal.wait(WAIT).await.unwrap();
    assert_eq!(event.event_type, EventType::NodeCreated);
    assert_eq!(event.path.as_deref(), Some("/p"));

    f.root.delete("/app/p", ANY_VERSION).await.unwrap();
    flush(&f.app, "/marker").await;
    assert_eq!(signal.fire_count(), 1);
    assert_eq!(f.app.watch_count(), 0);
}

#[tokio::test]
async fn read_watch_ignores_changes_the_read_already_saw() {
    let f = fixture().await;
    create(&f.app, "/p").await;
    let earlier = WatchSignal::new();
    f.app.exists("/p", Some(earlier.watcher())).await.unwrap();

    // the change reaches the session's event stream before the read is sent
    let writer = f.ensemble.connect();
    writer
        .send(Request::set_data("/app/p", b"v1", ANY_VERSION))
        .await
        .unwrap();

    let watch = WatchSignal::new();
    let (data, _) = f.app.get_data("/p", Some(watch.watcher())).await.unwrap();
    assert_eq!(data, b"v1");
    assert_eq!(earlier.fire_count(), 1);
    assert_eq!(watch.fire_count(), 0);
    assert_eq!(f.app.watch_count(), 1);

    writer
        .send(Request::set_data("/app/p", b"v2", ANY_VERSION))
        .await
        .unwrap();
    let event = watch.wait(WAIT).await.unwrap();
    assert_eq!(event.event_type, EventType::NodeDataChanged);
    assert_eq!(event.path.as_deref(), Some("/p"));
    assert_eq!(watch.fire_count(), 1);
    assert_eq!(f.app.watch_count(), 0);
}

#[tokio::test]
async fn events_arrive_in_connection_order() {
    let f = fixture().await;
    create(&f.app, "/p1").await;
    create(&f.app, "/p2").await;

    let queue = EventQueue::new();
    f.app.get_data("/p1", Some(queue.watcher())).await.unwrap();
    f.app.get_children("/p2", Some(queue.watcher())).await.unwrap();

    f.root.set_data("/app/p1", b"x", ANY_VERSION).await.unwrap();
    create(&f.root, "/app/p2/child").await;

    let first = queue.recv_timeout(WAIT).await.unwrap();
    let second = queue.recv_timeout(WAIT).await.unwrap();
    assert_eq!(
        (first.event_type, first.path.as_deref()),
        (EventType::NodeDataChanged, Some("/p1"))
    );
    assert_eq!(
        (second.event_type, second.path.as_deref()),
        (EventType::NodeChildrenChanged, Some("/p2"))
    );
}

#[tokio::test]
async fn every_registration_is_delivered() {
    let f = fixture().await;
    create(&f.app, "/shared").await;

    let a = WatchSignal::new();
    let b = WatchSignal::new();
    f.app.get_data("/shared", Some(a.watcher())).await.unwrap();
    f.app.get_data("/shared", Some(b.watcher())).await.unwrap();
    assert_eq!(f.app.watch_count(), 2);

    f.root.set_data("/app/shared", b"x", ANY_VERSION).await.unwrap();
    assert!(a.wait(WAIT).await.is_ok());
    assert!(b.wait(WAIT).await.is_ok());
}

#[tokio::test]
async fn deleted_node_leaves_no_dangling_watch() {
    let f = fixture().await;
    create(&f.app, "/d").await;

    let signal = WatchSignal::new();
    f.app.get_data("/d", Some(signal.watcher())).await.unwrap();
    f.app.delete("/d", ANY_VERSION).await.unwrap();

    let event = signal.wait(WAIT).await.unwrap();
    assert_eq!(event.event_type, EventType::NodeDeleted);
    assert!(f.app.exists("/d", None).await.unwrap().is_none());

    create(&f.app, "/d").await;
    f.app.set_data("/d", b"again", ANY_VERSION).await.unwrap();
    flush(&f.app, "/marker").await;
    assert_eq!(signal.fire_count(), 1);
}

#[tokio::test]
async fn watcher_can_rearm_itself() {
    let f = fixture().await;
    create(&f.app, "/r").await;

    let seen = EventQueue::new();
    let session = f.app.clone();
    let slot: Arc<Mutex<Option<Arc<dyn Watcher>>>> = Arc::new(Mutex::new(None));
    let rearm: Arc<dyn Watcher> = {
        let seen = seen.clone();
        let slot = slot.clone();
        Arc::new(move |event: &WatchedEvent| {
            let me = slot.lock().unwrap().clone();
            if let Some(me) = me {
                session.submit(Request::get_data("/r", Some(WatchMode::OneShot)), Some(me), |_| {});
            }
            seen.handle(event);
        })
    };
    *slot.lock().unwrap() = Some(rearm.clone());
    f.app.get_data("/r", Some(rearm)).await.unwrap();

    f.root.set_data("/app/r", b"1", ANY_VERSION).await.unwrap();
    assert_eq!(seen.recv_timeout(WAIT).await.unwrap().path.as_deref(), Some("/r"));

    // the re-registration goes through the pipeline before the next write
    flush(&f.app, "/marker").await;
    f.root.set_data("/app/r", b"2", ANY_VERSION).await.unwrap();
    assert_eq!(seen.recv_timeout(WAIT).await.unwrap().path.as_deref(), Some("/r"));

    slot.lock().unwrap().take();
}

#[tokio::test]
async fn completions_follow_earlier_events() {
    let f = fixture().await;
    create(&f.app, "/p").await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let watcher: Arc<dyn Watcher> = {
        let log = log.clone();
        Arc::new(move |event: &WatchedEvent| {
            log.lock().unwrap().push(format!("event {:?}", event.path));
        })
    };
    f.app.get_data("/p", Some(watcher)).await.unwrap();

    let (done_tx, done_rx) = oneshot::channel();
    let completion_log = log.clone();
    f.app.submit(
        Request::set_data("/p", b"async", ANY_VERSION),
        None,
        move |result| {
            let ok = matches!(result, Ok(Response::SetData { .. }));
            completion_log.lock().unwrap().push(format!("completion {}", ok));
            let _ = done_tx.send(());
        },
    );
    tokio::time::timeout(WAIT, done_rx).await.unwrap().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["event Some(\"/p\")".to_string(), "completion true".to_string()]
    );
}

#[tokio::test]
async fn async_requests_complete_in_submission_order() {
    let f = fixture().await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    let mut done_tx = Some(done_tx);

    for i in 0..10 {
        let order = order.clone();
        let done = if i == 9 { done_tx.take() } else { None };
        f.app.submit(
            Request::create(format!("/n{}", i), b"", &Acl::open_unsafe(), CreateMode::Persistent),
            None,
            move |result| {
                if let Ok(Response::Create { path }) = result {
                    order.lock().unwrap().push(path);
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            },
        );
    }
    tokio::time::timeout(WAIT, done_rx).await.unwrap().unwrap();

    let expected: Vec<String> = (0..10).map(|i| format!("/n{}", i)).collect();
    assert_eq!(*order.lock().unwrap(), expected);
    assert!(f.ensemble.node_exists("/app/n9"));
}

#[tokio::test]
async fn removed_watch_does_not_fire() {
    let f = fixture().await;
    create(&f.app, "/x").await;

    let signal = WatchSignal::new();
    f.app.get_children("/x", Some(signal.watcher())).await.unwrap();
    assert_eq!(f.app.remove_watches("/x", WatcherKind::Child).await.unwrap(), 1);

    create(&f.root, "/app/x/child").await;
    flush(&f.app, "/marker").await;
    assert_eq!(signal.fire_count(), 0);
}
