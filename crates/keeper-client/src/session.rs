// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Chrooted session over a raw ensemble connection.
//!
//! Every operation runs the same three steps: translate the client path into
//! server space, send through the session's request pipeline, translate the
//! response (or the error's path) back into client space. Requests from all
//! callers share one pipeline task, so responses and asynchronous
//! completions keep the order in which requests were issued.
//!
//! Responses are handed back through the session's dispatcher. A watch
//! supplied with a read is activated there, after every event that arrived
//! ahead of the response and only when the read succeeded, so a one-shot
//! watch never fires for a change the read already reflects.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use keeper_logging::redact;
use keeper_proto::{
    Acl, CONFIG_NODE, CreateMode, KeeperState, Request, Response, Stat, WatchMode, WatcherEvent,
    WatcherKind, validate_request,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SessionConfig};
use crate::connection::{RawConnection, SessionState};
use crate::dispatcher::{DispatchQueue, DispatcherHandle, EventDispatcher};
use crate::error::{ZkError, ZkResult};
use crate::path::{ChrootPrefix, PathTranslator};
use crate::watch::{PendingWatch, WatchRegistry, Watcher};

type Respond = Box<dyn FnOnce(ZkResult<Response>) + Send>;

struct PendingCall {
    request: Request,
    watch: Option<PendingWatch>,
    respond: Respond,
}

/// Request translated into server space, with the watch it carries
struct Prepared {
    request: Request,
    client_path: Option<String>,
    watch: Option<PendingWatch>,
}

struct SessionInner {
    raw: Arc<dyn RawConnection>,
    translator: Arc<PathTranslator>,
    registry: Arc<WatchRegistry>,
    dispatcher: DispatcherHandle,
    calls: mpsc::UnboundedSender<PendingCall>,
    closed: watch::Sender<bool>,
    disconnected: AtomicBool,
    response_timeout: Duration,
}

/// Handle to a session whose namespace is rooted at its chroot prefix.
///
/// Cloning is cheap; all clones share the same session.
#[derive(Clone)]
pub struct ChrootSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for ChrootSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChrootSession")
            .field("session_id", &self.session_id())
            .field("chroot", &self.chroot().map(ChrootPrefix::as_str))
            .field("state", &self.state())
            .finish()
    }
}

impl ChrootSession {
    /// Open a session over `raw` using the chroot and timeouts in `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        raw: Arc<dyn RawConnection>,
        config: &SessionConfig,
        default_watcher: Option<Arc<dyn Watcher>>,
    ) -> ZkResult<Self> {
        let translator = config.translator().map_err(|err| match err {
            ConfigError::Path(err) => err,
            other => ZkError::InvalidConfig(other.to_string()),
        })?;
        Self::open_with_translator(raw, translator, config.response_timeout(), default_watcher)
    }

    pub fn open_with_translator(
        raw: Arc<dyn RawConnection>,
        translator: PathTranslator,
        response_timeout: Duration,
        default_watcher: Option<Arc<dyn Watcher>>,
    ) -> ZkResult<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ZkError::InvalidState("a session needs a tokio runtime"));
        }
        let events = raw
            .subscribe_events()
            .ok_or(ZkError::InvalidState("event stream already taken"))?;

        // get_config always addresses the global node, whatever else is exempt
        let translator = Arc::new(translator.exempting(CONFIG_NODE));
        let registry = Arc::new(WatchRegistry::new());
        let dispatcher =
            EventDispatcher::new(translator.clone(), registry.clone(), default_watcher)
                .spawn(events);

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(run_pipeline(
            raw.clone(),
            calls_rx,
            closed_rx,
            dispatcher.queue().clone(),
        ));

        info!(
            session_id = raw.session_id(),
            chroot = translator.chroot().map(ChrootPrefix::as_str),
            "session opened"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                raw,
                translator,
                registry,
                dispatcher,
                calls: calls_tx,
                closed: closed_tx,
                disconnected: AtomicBool::new(false),
                response_timeout,
            }),
        })
    }

    pub fn session_id(&self) -> i64 {
        self.inner.raw.session_id()
    }

    pub fn state(&self) -> SessionState {
        if *self.inner.closed.borrow() {
            SessionState::Closed
        } else {
            self.inner.raw.session_state()
        }
    }

    pub fn chroot(&self) -> Option<&ChrootPrefix> {
        self.inner.translator.chroot()
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.inner.translator
    }

    /// Locally pending watch registrations
    pub fn watch_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Create a node; returns the created path in client space.
    pub async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> ZkResult<String> {
        match self.execute(Request::create(path, data, acl, mode), None).await? {
            Response::Create { path } => Ok(path),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn delete(&self, path: &str, version: i32) -> ZkResult<()> {
        match self.execute(Request::delete(path, version), None).await? {
            Response::Delete => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Node metadata, or `None` when absent.
    ///
    /// The watcher is kept when the node is absent and fires on creation.
    pub async fn exists(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> ZkResult<Option<Stat>> {
        let request = Request::exists(path, watcher.as_ref().map(|_| WatchMode::OneShot));
        match self.execute(request, watcher).await? {
            Response::Exists { stat } => Ok(stat),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_data(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> ZkResult<(Vec<u8>, Stat)> {
        let request = Request::get_data(path, watcher.as_ref().map(|_| WatchMode::OneShot));
        match self.execute(request, watcher).await? {
            Response::GetData { data, stat } => Ok((data, stat)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn set_data(&self, path: &str, data: &[u8], version: i32) -> ZkResult<Stat> {
        match self.execute(Request::set_data(path, data, version), None).await? {
            Response::SetData { stat } => Ok(stat),
            other => Err(unexpected(&other)),
        }
    }

    /// Child names of `path`; names are relative and never translated.
    pub async fn get_children(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> ZkResult<Vec<String>> {
        self.get_children_with_stat(path, watcher)
            .await
            .map(|(children, _)| children)
    }

    pub async fn get_children_with_stat(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> ZkResult<(Vec<String>, Stat)> {
        let request = Request::get_children(path, watcher.as_ref().map(|_| WatchMode::OneShot));
        match self.execute(request, watcher).await? {
            Response::GetChildren { children, stat } => Ok((children, stat)),
            other => Err(unexpected(&other)),
        }
    }

    /// Read the ensemble configuration node, bypassing the chroot.
    ///
    /// A supplied watcher is registered as a persistent data watch on the
    /// global node and receives every later change until removed or the
    /// session ends.
    pub async fn get_config(&self, watcher: Option<Arc<dyn Watcher>>) -> ZkResult<(Vec<u8>, Stat)> {
        let request = Request::get_data(CONFIG_NODE, watcher.as_ref().map(|_| WatchMode::Persistent));
        match self.execute(request, watcher).await? {
            Response::GetData { data, stat } => Ok((data, stat)),
            other => Err(unexpected(&other)),
        }
    }

    /// Remove this session's watches of `kind` on `path`, persistent ones
    /// included. Returns the number of local registrations removed.
    pub async fn remove_watches(&self, path: &str, kind: WatcherKind) -> ZkResult<usize> {
        let request = Request::RemoveWatches {
            path: path.to_string(),
            kind,
        };
        let prepared = self.inner.prepare(request, None)?;
        let server_path = prepared.request.path().unwrap_or_default().to_string();
        let removed = self.inner.registry.remove_kind(&server_path, kind);
        debug!(client_path = path, server_path = %server_path, ?kind, removed, "removed local watches");

        let result = self.inner.call(prepared.request.clone(), None).await;
        match self.inner.finish(prepared, result)? {
            Response::RemoveWatches => Ok(removed),
            other => Err(unexpected(&other)),
        }
    }

    /// Add credentials to the session.
    ///
    /// `AuthFailed` is returned to the caller only; the session stays usable.
    pub async fn add_auth(&self, scheme: &str, auth: &[u8]) -> ZkResult<()> {
        debug!(scheme, auth = %redact(String::from_utf8_lossy(auth)), "adding auth");
        let request = Request::AddAuth {
            scheme: scheme.to_string(),
            auth: auth.to_vec(),
        };
        match self.execute(request, None).await? {
            Response::AddAuth => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Wait until the server this session talks to has caught up with the
    /// leader for `path`.
    pub async fn sync(&self, path: &str) -> ZkResult<String> {
        match self.execute(Request::Sync { path: path.to_string() }, None).await? {
            Response::Sync { path } => Ok(path),
            other => Err(unexpected(&other)),
        }
    }

    /// Issue `request` (client-space paths) without waiting.
    ///
    /// `completion` receives the translated result on the dispatcher task,
    /// after every watch event that reached the connection before the
    /// response. `watcher` is activated when the request asks for a watch
    /// and succeeds, before `completion` runs.
    pub fn submit<F>(&self, request: Request, watcher: Option<Arc<dyn Watcher>>, completion: F)
    where
        F: FnOnce(ZkResult<Response>) + Send + 'static,
    {
        let mut prepared = match self.inner.prepare(request, watcher) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.inner.dispatcher.complete(move || completion(Err(err)));
                return;
            }
        };

        let server_request = prepared.request.clone();
        let watch = prepared.watch.take();
        let inner = self.inner.clone();
        let respond: Respond = Box::new(move |result| completion(inner.finish(prepared, result)));
        self.inner.enqueue(server_request, watch, respond);
    }

    /// Close the session.
    ///
    /// Pending synchronous calls fail with `SessionClosed`, the default
    /// watcher receives a `Closed` event and every watch is dropped.
    /// Closing an already closed session does nothing.
    pub async fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }

        let session_id = self.session_id();
        if self.inner.raw.session_state().is_alive() {
            match tokio::time::timeout(
                self.inner.response_timeout,
                self.inner.raw.send(Request::CloseSession),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(session_id, %err, "close request failed"),
                Err(_) => warn!(session_id, "close request timed out"),
            }
        }

        self.inner
            .dispatcher
            .inject(WatcherEvent::session(KeeperState::Closed));
        self.inner.dispatcher.shutdown().await;
        let dropped = self.inner.registry.drop_all();
        info!(session_id, dropped, "session closed");
    }

    async fn execute(
        &self,
        request: Request,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> ZkResult<Response> {
        let mut prepared = self.inner.prepare(request, watcher)?;
        let watch = prepared.watch.take();
        let result = self.inner.call(prepared.request.clone(), watch).await;
        self.inner.finish(prepared, result)
    }
}

impl SessionInner {
    fn check_open(&self) -> ZkResult<()> {
        if *self.closed.borrow() {
            return Err(ZkError::SessionClosed);
        }
        match self.raw.session_state() {
            SessionState::Expired => Err(ZkError::SessionExpired),
            SessionState::Closed => Err(ZkError::SessionClosed),
            SessionState::Connecting | SessionState::Connected => Ok(()),
        }
    }

    fn prepare(&self, request: Request, watcher: Option<Arc<dyn Watcher>>) -> ZkResult<Prepared> {
        self.check_open()?;
        validate_request(&request).map_err(|err| ZkError::InvalidPath {
            path: request.path().unwrap_or_default().to_string(),
            reason: err.to_string(),
        })?;
        if let Request::Create { path, mode, .. } = &request {
            if mode.is_sequential() && path == "/" && self.translator.chroot().is_some() {
                return Err(ZkError::InvalidPath {
                    path: path.clone(),
                    reason: "sequential create at the chroot root names a sibling of the chroot"
                        .to_string(),
                });
            }
        }

        let client_path = request.path().map(str::to_string);
        let request = match &client_path {
            Some(path) => request.with_path(self.translator.to_server(path)),
            None => request,
        };

        let watch = match (request.watch(), watcher, request.path()) {
            (Some((kind, mode)), Some(watcher), Some(server_path)) => Some(PendingWatch {
                server_path: server_path.to_string(),
                kind,
                mode,
                watcher,
            }),
            _ => None,
        };

        debug!(
            op = request.op_name(),
            client_path = client_path.as_deref(),
            server_path = request.path(),
            watch = watch.is_some(),
            "request"
        );
        Ok(Prepared {
            request,
            client_path,
            watch,
        })
    }

    /// Server path back to client space, falling back to the caller's path
    fn client_path_for(&self, server_path: String, fallback: Option<&str>) -> String {
        match self.translator.to_client_checked(&server_path) {
            Ok(path) => path,
            Err(err) => {
                warn!(%err, "untranslatable path in result");
                fallback.map(str::to_string).unwrap_or(server_path)
            }
        }
    }

    fn finish(&self, prepared: Prepared, result: ZkResult<Response>) -> ZkResult<Response> {
        match result {
            Ok(response) => {
                if self.disconnected.swap(false, Ordering::SeqCst) {
                    self.dispatcher
                        .inject(WatcherEvent::session(KeeperState::SyncConnected));
                }
                let fallback = prepared.client_path.as_deref();
                Ok(response.map_path(|p| self.client_path_for(p, fallback)))
            }
            Err(err) => {
                match &err {
                    ZkError::ConnectionLoss => {
                        self.disconnected.store(true, Ordering::SeqCst);
                        self.dispatcher
                            .inject(WatcherEvent::session(KeeperState::Disconnected));
                    }
                    ZkError::SessionExpired => {
                        self.dispatcher
                            .inject(WatcherEvent::session(KeeperState::Expired));
                    }
                    _ => {}
                }
                debug!(
                    op = prepared.request.op_name(),
                    client_path = prepared.client_path.as_deref(),
                    %err,
                    "request failed"
                );
                let fallback = prepared.client_path.as_deref();
                Err(err.map_path(|p| self.client_path_for(p, fallback)))
            }
        }
    }

    /// Queue `request`; a stopped pipeline answers `SessionClosed` at once.
    fn enqueue(&self, request: Request, watch: Option<PendingWatch>, respond: Respond) {
        let call = PendingCall {
            request,
            watch,
            respond,
        };
        if let Err(mpsc::error::SendError(call)) = self.calls.send(call) {
            (call.respond)(Err(ZkError::SessionClosed));
        }
    }

    async fn call(&self, request: Request, watch: Option<PendingWatch>) -> ZkResult<Response> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            request,
            watch,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;

            _ = closed.wait_for(|c| *c) => Err(ZkError::SessionClosed),
            response = tokio::time::timeout(self.response_timeout, rx) => match response {
                Err(_) => Err(ZkError::OperationTimeout),
                Ok(Err(_)) => Err(ZkError::SessionClosed),
                Ok(Ok(result)) => result,
            },
        }
    }
}

fn unexpected(response: &Response) -> ZkError {
    ZkError::UnexpectedResponse {
        op: response.op_name(),
    }
}

/// Send queued calls one at a time, in submission order.
///
/// Each response goes back through the dispatcher queue, preceded by the
/// activation of the call's watch when the read succeeded.
async fn run_pipeline(
    raw: Arc<dyn RawConnection>,
    mut calls: mpsc::UnboundedReceiver<PendingCall>,
    closed: watch::Receiver<bool>,
    dispatcher: DispatchQueue,
) {
    while let Some(PendingCall {
        request,
        watch,
        respond,
    }) = calls.recv().await
    {
        if *closed.borrow() {
            respond(Err(ZkError::SessionClosed));
            continue;
        }
        let is_exists = matches!(request, Request::Exists { .. });
        let result = match raw.send(request).await {
            // absence is an answer for exists, and its watch fires on creation
            Err(ZkError::NotFound { .. }) if is_exists => Ok(Response::Exists { stat: None }),
            other => other,
        };
        if let (Ok(_), Some(watch)) = (&result, watch) {
            if !*closed.borrow() {
                dispatcher.register(watch);
            }
        }
        dispatcher.complete(move || respond(result));
    }
    debug!("request pipeline stopped");
}
