// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process ensemble for exercising sessions without a server

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use keeper_proto::{
    ANY_VERSION, Acl, CONFIG_NODE, CreateMode, EventType, Id, KeeperState, Perms, Request,
    Response, Stat, WatchMode, WatcherEvent, WatcherKind, validate_path,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connection::{EventStream, RawConnection, SessionState};
use crate::error::{ZkError, ZkResult};

/// Contents of the configuration node when the ensemble starts
pub const INITIAL_CONFIG: &[u8] =
    b"server.1=127.0.0.1:2888:3888:participant;0.0.0.0:2181\nversion=100000000";

const FIRST_SESSION_ID: i64 = 0x1000;
const SUPER_USER: &str = "super";

struct Node {
    data: Vec<u8>,
    acl: Vec<Acl>,
    stat: Stat,
    children: BTreeSet<String>,
}

struct SessionEntry {
    events: mpsc::UnboundedSender<WatcherEvent>,
    state: SessionState,
    disconnected: bool,
    auth: Vec<Id>,
    is_super: bool,
    ephemerals: BTreeSet<String>,
}

#[derive(Default)]
struct EnsembleState {
    nodes: HashMap<String, Node>,
    sessions: BTreeMap<i64, SessionEntry>,
    data_watches: HashMap<String, BTreeMap<i64, WatchMode>>,
    child_watches: HashMap<String, BTreeMap<i64, WatchMode>>,
    zxid: i64,
    next_session: i64,
    superuser: Option<String>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}

fn invalid(path: &str, reason: impl ToString) -> ZkError {
    ZkError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

impl EnsembleState {
    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn insert_node(&mut self, path: &str, data: Vec<u8>, acl: Vec<Acl>, owner: i64) {
        let zxid = self.next_zxid();
        let now = now_millis();
        let data_length = i32::try_from(data.len()).unwrap_or(i32::MAX);
        self.nodes.insert(
            path.to_string(),
            Node {
                data,
                acl,
                stat: Stat {
                    czxid: zxid,
                    mzxid: zxid,
                    ctime: now,
                    mtime: now,
                    pzxid: zxid,
                    ephemeral_owner: owner,
                    data_length,
                    ..Stat::default()
                },
                children: BTreeSet::new(),
            },
        );
        if path != "/" {
            let (parent, name) = split_parent(path);
            if let Some(parent) = self.nodes.get_mut(parent) {
                parent.children.insert(name.to_string());
                parent.stat.cversion += 1;
                parent.stat.num_children = i32::try_from(parent.children.len()).unwrap_or(i32::MAX);
                parent.stat.pzxid = zxid;
            }
        }
    }

    fn session(&self, session_id: i64) -> ZkResult<&SessionEntry> {
        let entry = self.sessions.get(&session_id).ok_or(ZkError::SessionExpired)?;
        match entry.state {
            SessionState::Expired => Err(ZkError::SessionExpired),
            SessionState::Closed => Err(ZkError::SessionClosed),
            _ if entry.disconnected => Err(ZkError::ConnectionLoss),
            _ => Ok(entry),
        }
    }

    fn check_acl(&self, session_id: i64, acl: &[Acl], perm: Perms, path: &str) -> ZkResult<()> {
        let Some(entry) = self.sessions.get(&session_id) else {
            return Err(ZkError::SessionExpired);
        };
        if entry.is_super {
            return Ok(());
        }
        let allowed = acl.iter().any(|a| {
            a.perms.contains(perm) && (a.id == Id::anyone() || entry.auth.contains(&a.id))
        });
        if allowed {
            Ok(())
        } else {
            Err(ZkError::NoAuth {
                path: path.to_string(),
            })
        }
    }

    fn add_watch(&mut self, kind: WatcherKind, path: &str, session_id: i64, mode: WatchMode) {
        let table = match kind {
            WatcherKind::Child => &mut self.child_watches,
            _ => &mut self.data_watches,
        };
        let slot = table
            .entry(path.to_string())
            .or_default()
            .entry(session_id)
            .or_insert(mode);
        if mode == WatchMode::Persistent {
            *slot = WatchMode::Persistent;
        }
    }

    fn remove_watches(&mut self, path: &str, session_id: i64, kind: WatcherKind) {
        let mut tables = Vec::new();
        if kind.covers(WatcherKind::Data) || kind.covers(WatcherKind::Exist) {
            tables.push(&mut self.data_watches);
        }
        if kind.covers(WatcherKind::Child) {
            tables.push(&mut self.child_watches);
        }
        for table in tables {
            if let Some(watchers) = table.get_mut(path) {
                watchers.remove(&session_id);
                if watchers.is_empty() {
                    table.remove(path);
                }
            }
        }
    }

    /// Notify every session watching `path`, consuming one-shot watches
    fn trigger(&mut self, event_type: EventType, path: &str) {
        let mut tables = Vec::new();
        if matches!(
            event_type,
            EventType::NodeCreated | EventType::NodeDataChanged | EventType::NodeDeleted
        ) {
            tables.push(&mut self.data_watches);
        }
        if matches!(
            event_type,
            EventType::NodeChildrenChanged | EventType::NodeDeleted
        ) {
            tables.push(&mut self.child_watches);
        }

        let mut targets = BTreeSet::new();
        for table in tables {
            if let Some(watchers) = table.get_mut(path) {
                targets.extend(watchers.keys().copied());
                watchers.retain(|_, mode| *mode == WatchMode::Persistent);
                if watchers.is_empty() {
                    table.remove(path);
                }
            }
        }

        for session_id in targets {
            if let Some(entry) = self.sessions.get(&session_id) {
                if entry.state == SessionState::Connected && !entry.disconnected {
                    trace!(session_id, path, ?event_type, "firing watch");
                    let _ = entry.events.send(WatcherEvent::node(event_type, path));
                }
            }
        }
    }

    fn create(
        &mut self,
        session_id: i64,
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    ) -> ZkResult<Response> {
        if path == "/" {
            return Err(ZkError::NodeExists {
                path: path.to_string(),
            });
        }
        let (parent_path, _) = split_parent(path);
        let Some(parent) = self.nodes.get(parent_path) else {
            return Err(ZkError::NotFound {
                path: path.to_string(),
            });
        };
        if parent.stat.ephemeral_owner != 0 {
            return Err(ZkError::NoChildrenForEphemerals {
                path: path.to_string(),
            });
        }
        self.check_acl(session_id, &parent.acl, Perms::CREATE, path)?;

        let created = if mode.is_sequential() {
            format!("{}{:010}", path, parent.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&created) {
            return Err(ZkError::NodeExists { path: created });
        }

        let acl = if acl.is_empty() { Acl::open_unsafe() } else { acl };
        let owner = if mode.is_ephemeral() { session_id } else { 0 };
        self.insert_node(&created, data, acl, owner);
        if mode.is_ephemeral() {
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                entry.ephemerals.insert(created.clone());
            }
        }

        let (parent_path, _) = split_parent(&created);
        self.trigger(EventType::NodeCreated, &created);
        self.trigger(EventType::NodeChildrenChanged, parent_path);
        Ok(Response::Create { path: created })
    }

    fn delete(&mut self, session_id: i64, path: &str, version: i32) -> ZkResult<Response> {
        if path == "/" {
            return Err(invalid(path, "the root node cannot be deleted"));
        }
        let Some(node) = self.nodes.get(path) else {
            return Err(ZkError::NotFound {
                path: path.to_string(),
            });
        };
        if version != ANY_VERSION && version != node.stat.version {
            return Err(ZkError::VersionConflict {
                path: path.to_string(),
            });
        }
        if !node.children.is_empty() {
            return Err(ZkError::NotEmpty {
                path: path.to_string(),
            });
        }
        let (parent_path, _) = split_parent(path);
        if let Some(parent) = self.nodes.get(parent_path) {
            self.check_acl(session_id, &parent.acl, Perms::DELETE, path)?;
        }

        self.remove_node(path);
        self.trigger(EventType::NodeDeleted, path);
        self.trigger(EventType::NodeChildrenChanged, parent_path);
        Ok(Response::Delete)
    }

    fn remove_node(&mut self, path: &str) {
        let Some(node) = self.nodes.remove(path) else {
            return;
        };
        let zxid = self.next_zxid();
        let (parent_path, name) = split_parent(path);
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.remove(name);
            parent.stat.cversion += 1;
            parent.stat.num_children = i32::try_from(parent.children.len()).unwrap_or(i32::MAX);
            parent.stat.pzxid = zxid;
        }
        if node.stat.ephemeral_owner != 0 {
            if let Some(owner) = self.sessions.get_mut(&node.stat.ephemeral_owner) {
                owner.ephemerals.remove(path);
            }
        }
    }

    fn set_data(
        &mut self,
        session_id: i64,
        path: &str,
        data: Vec<u8>,
        version: i32,
    ) -> ZkResult<Response> {
        let Some(node) = self.nodes.get(path) else {
            return Err(ZkError::NotFound {
                path: path.to_string(),
            });
        };
        if version != ANY_VERSION && version != node.stat.version {
            return Err(ZkError::VersionConflict {
                path: path.to_string(),
            });
        }
        self.check_acl(session_id, &node.acl, Perms::WRITE, path)?;

        let zxid = self.next_zxid();
        let stat = match self.nodes.get_mut(path) {
            Some(node) => {
                node.stat.version += 1;
                node.stat.mzxid = zxid;
                node.stat.mtime = now_millis();
                node.stat.data_length = i32::try_from(data.len()).unwrap_or(i32::MAX);
                node.data = data;
                node.stat.clone()
            }
            None => {
                return Err(ZkError::NotFound {
                    path: path.to_string(),
                });
            }
        };
        self.trigger(EventType::NodeDataChanged, path);
        Ok(Response::SetData { stat })
    }

    fn read(&mut self, session_id: i64, request: Request) -> ZkResult<Response> {
        match request {
            Request::Exists { path, watch } => {
                let stat = self.nodes.get(&path).map(|n| n.stat.clone());
                if let Some(mode) = watch {
                    self.add_watch(WatcherKind::Exist, &path, session_id, mode);
                }
                Ok(Response::Exists { stat })
            }
            Request::GetData { path, watch } => {
                let Some(node) = self.nodes.get(&path) else {
                    return Err(ZkError::NotFound { path });
                };
                self.check_acl(session_id, &node.acl, Perms::READ, &path)?;
                let response = Response::GetData {
                    data: node.data.clone(),
                    stat: node.stat.clone(),
                };
                if let Some(mode) = watch {
                    self.add_watch(WatcherKind::Data, &path, session_id, mode);
                }
                Ok(response)
            }
            Request::GetChildren { path, watch } => {
                let Some(node) = self.nodes.get(&path) else {
                    return Err(ZkError::NotFound { path });
                };
                self.check_acl(session_id, &node.acl, Perms::READ, &path)?;
                let response = Response::GetChildren {
                    children: node.children.iter().cloned().collect(),
                    stat: node.stat.clone(),
                };
                if let Some(mode) = watch {
                    self.add_watch(WatcherKind::Child, &path, session_id, mode);
                }
                Ok(response)
            }
            other => Err(ZkError::UnexpectedResponse {
                op: other.op_name(),
            }),
        }
    }

    fn add_auth(&mut self, session_id: i64, scheme: &str, auth: &[u8]) -> ZkResult<Response> {
        if scheme != "digest" {
            return Err(ZkError::AuthFailed);
        }
        let credentials = String::from_utf8_lossy(auth);
        let Some((user, password)) = credentials.split_once(':') else {
            return Err(ZkError::AuthFailed);
        };
        let is_super = user == SUPER_USER;
        if is_super && self.superuser.as_deref() != Some(password) {
            return Err(ZkError::AuthFailed);
        }

        let id = Id::new("digest", user);
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.is_super |= is_super;
            if !entry.auth.contains(&id) {
                entry.auth.push(id);
            }
        }
        Ok(Response::AddAuth)
    }

    /// Tear down a session: drop its watches and delete its ephemerals
    fn end_session(&mut self, session_id: i64, state: SessionState) {
        let ephemerals = match self.sessions.get_mut(&session_id) {
            Some(entry) => {
                entry.state = state;
                std::mem::take(&mut entry.ephemerals)
            }
            None => return,
        };
        for table in [&mut self.data_watches, &mut self.child_watches] {
            table.retain(|_, watchers| {
                watchers.remove(&session_id);
                !watchers.is_empty()
            });
        }
        for path in ephemerals {
            if self.nodes.get(&path).is_some_and(|n| n.children.is_empty()) {
                self.remove_node(&path);
                let (parent, _) = split_parent(&path);
                self.trigger(EventType::NodeDeleted, &path);
                self.trigger(EventType::NodeChildrenChanged, parent);
            }
        }
        debug!(session_id, ?state, "session ended");
    }

    fn handle(&mut self, session_id: i64, request: Request) -> ZkResult<Response> {
        self.session(session_id)?;
        if let Some(path) = request.path() {
            let sequential = matches!(request, Request::Create { mode, .. } if mode.is_sequential());
            validate_path(path, sequential).map_err(|e| invalid(path, e))?;
        }

        match request {
            Request::Create {
                path,
                data,
                acl,
                mode,
            } => self.create(session_id, &path, data, acl, mode),
            Request::Delete { path, version } => self.delete(session_id, &path, version),
            Request::SetData {
                path,
                data,
                version,
            } => self.set_data(session_id, &path, data, version),
            Request::RemoveWatches { path, kind } => {
                self.remove_watches(&path, session_id, kind);
                Ok(Response::RemoveWatches)
            }
            Request::AddAuth { scheme, auth } => self.add_auth(session_id, &scheme, &auth),
            Request::Sync { path } => Ok(Response::Sync { path }),
            Request::CloseSession => {
                self.end_session(session_id, SessionState::Closed);
                Ok(Response::CloseSession)
            }
            read => self.read(session_id, read),
        }
    }
}

/// Shared in-memory node tree with server-side watches.
///
/// Events are pushed to the owning connections before the triggering
/// request returns, as a real server orders a notification ahead of the
/// response that caused it.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEnsemble {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Ensemble whose configuration node only `digest super:<password>` may write
    pub fn with_superuser(password: impl Into<String>) -> Self {
        Self::build(Some(password.into()))
    }

    fn build(superuser: Option<String>) -> Self {
        let mut state = EnsembleState {
            next_session: FIRST_SESSION_ID,
            ..EnsembleState::default()
        };
        let config_acl = if superuser.is_some() {
            Acl::read_unsafe()
        } else {
            Acl::open_unsafe()
        };
        state.superuser = superuser;
        state.insert_node("/", Vec::new(), Acl::open_unsafe(), 0);
        state.insert_node("/zookeeper", Vec::new(), Acl::open_unsafe(), 0);
        state.insert_node(CONFIG_NODE, INITIAL_CONFIG.to_vec(), config_acl, 0);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a new session
    pub fn connect(&self) -> Arc<InMemoryConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let session_id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            session_id,
            SessionEntry {
                events: tx,
                state: SessionState::Connected,
                disconnected: false,
                auth: Vec::new(),
                is_super: false,
                ephemerals: BTreeSet::new(),
            },
        );
        debug!(session_id, "session connected");
        Arc::new(InMemoryConnection {
            ensemble: self.clone(),
            session_id,
            events: Mutex::new(Some(rx)),
        })
    }

    fn notify(&self, session_id: i64, update: impl FnOnce(&mut SessionEntry) -> Option<KeeperState>) {
        let mut state = self.lock();
        if let Some(entry) = state.sessions.get_mut(&session_id) {
            if let Some(keeper_state) = update(entry) {
                let _ = entry.events.send(WatcherEvent::session(keeper_state));
            }
        }
    }

    /// Expire a session as the server would after a missed timeout
    pub fn expire_session(&self, session_id: i64) {
        self.notify(session_id, |_| Some(KeeperState::Expired));
        self.lock().end_session(session_id, SessionState::Expired);
    }

    /// Drop the session's connection; requests fail with `ConnectionLoss`
    pub fn disconnect(&self, session_id: i64) {
        self.notify(session_id, |entry| {
            entry.disconnected = true;
            Some(KeeperState::Disconnected)
        });
    }

    pub fn reconnect(&self, session_id: i64) {
        self.notify(session_id, |entry| {
            entry.disconnected = false;
            Some(KeeperState::SyncConnected)
        });
    }

    /// Data of a node, bypassing sessions and ACLs
    pub fn node_data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).map(|n| n.data.clone())
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// Server-side watches held for a session
    pub fn server_watch_count(&self, session_id: i64) -> usize {
        let state = self.lock();
        state
            .data_watches
            .values()
            .chain(state.child_watches.values())
            .filter(|w| w.contains_key(&session_id))
            .count()
    }
}

/// [`RawConnection`] for one session of an [`InMemoryEnsemble`]
pub struct InMemoryConnection {
    ensemble: InMemoryEnsemble,
    session_id: i64,
    events: Mutex<Option<EventStream>>,
}

impl InMemoryConnection {
    pub fn ensemble(&self) -> &InMemoryEnsemble {
        &self.ensemble
    }
}

#[async_trait]
impl RawConnection for InMemoryConnection {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn send(&self, request: Request) -> ZkResult<Response> {
        trace!(session_id = self.session_id, op = request.op_name(), path = request.path(), "server request");
        self.ensemble.lock().handle(self.session_id, request)
    }

    fn subscribe_events(&self) -> Option<EventStream> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn session_state(&self) -> SessionState {
        let state = self.ensemble.lock();
        match state.sessions.get(&self.session_id) {
            Some(entry) if entry.disconnected && entry.state == SessionState::Connected => {
                SessionState::Connecting
            }
            Some(entry) => entry.state,
            None => SessionState::Closed,
        }
    }
}
