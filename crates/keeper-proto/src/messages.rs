// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request, response and event types exchanged with the ensemble

use serde::{Deserialize, Serialize};

/// Ensemble-global dynamic configuration node.
pub const CONFIG_NODE: &str = "/zookeeper/config";

/// Version sentinel matching any node version.
pub const ANY_VERSION: i32 = -1;

/// Node metadata returned by reads and writes
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

/// Permission bit set attached to an ACL entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Perms(pub u32);

impl Perms {
    pub const READ: Perms = Perms(1);
    pub const WRITE: Perms = Perms(1 << 1);
    pub const CREATE: Perms = Perms(1 << 2);
    pub const DELETE: Perms = Perms(1 << 3);
    pub const ADMIN: Perms = Perms(1 << 4);
    pub const ALL: Perms = Perms(0b1_1111);

    pub fn contains(self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Perms {
    type Output = Perms;

    fn bitor(self, rhs: Perms) -> Perms {
        Perms(self.0 | rhs.0)
    }
}

/// Authenticated identity, e.g. `world:anyone` or `digest:alice`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    pub scheme: String,
    pub id: String,
}

impl Id {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
        }
    }

    pub fn anyone() -> Self {
        Self::new("world", "anyone")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    pub perms: Perms,
    pub id: Id,
}

impl Acl {
    /// Fully open ACL: everyone may do everything.
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl {
            perms: Perms::ALL,
            id: Id::anyone(),
        }]
    }

    /// Everyone may read, nobody may write.
    pub fn read_unsafe() -> Vec<Acl> {
        vec![Acl {
            perms: Perms::READ,
            id: Id::anyone(),
        }]
    }
}

/// How a node is created
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Lifetime of a watch registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchMode {
    /// Delivered at most once, then discarded
    OneShot,
    /// Delivered on every matching event until removed or the session ends
    Persistent,
}

/// Which class of change a watch observes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatcherKind {
    Data,
    Exist,
    Child,
    /// Wildcard used when removing watches
    Any,
}

impl WatcherKind {
    /// Kinds that a given node event should fire.
    pub fn triggered_by(event_type: EventType) -> &'static [WatcherKind] {
        match event_type {
            EventType::NodeCreated | EventType::NodeDataChanged => {
                &[WatcherKind::Data, WatcherKind::Exist]
            }
            EventType::NodeDeleted => &[WatcherKind::Data, WatcherKind::Exist, WatcherKind::Child],
            EventType::NodeChildrenChanged => &[WatcherKind::Child],
            EventType::None => &[],
        }
    }

    pub fn covers(self, other: WatcherKind) -> bool {
        self == WatcherKind::Any || self == other
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// Session-state notification, not tied to a path
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeeperState {
    Disconnected,
    SyncConnected,
    AuthFailed,
    Expired,
    Closed,
}

impl KeeperState {
    /// Whether the session is void once this state is observed.
    pub fn is_terminal(self) -> bool {
        matches!(self, KeeperState::Expired | KeeperState::Closed)
    }
}

/// Event pushed by the ensemble over the connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherEvent {
    pub event_type: EventType,
    pub state: KeeperState,
    /// Server-space path; `None` for session-state events
    pub path: Option<String>,
}

impl WatcherEvent {
    pub fn node(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            state: KeeperState::SyncConnected,
            path: Some(path.into()),
        }
    }

    pub fn session(state: KeeperState) -> Self {
        Self {
            event_type: EventType::None,
            state,
            path: None,
        }
    }

    pub fn is_session_event(&self) -> bool {
        self.event_type == EventType::None
    }
}

/// Request sent to the ensemble
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    Create {
        path: String,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: i32,
    },
    Exists {
        path: String,
        watch: Option<WatchMode>,
    },
    GetData {
        path: String,
        watch: Option<WatchMode>,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: i32,
    },
    GetChildren {
        path: String,
        watch: Option<WatchMode>,
    },
    RemoveWatches {
        path: String,
        kind: WatcherKind,
    },
    AddAuth {
        scheme: String,
        auth: Vec<u8>,
    },
    Sync {
        path: String,
    },
    CloseSession,
}

impl Request {
    pub fn create(path: impl Into<String>, data: &[u8], acl: &[Acl], mode: CreateMode) -> Self {
        Request::Create {
            path: path.into(),
            data: data.to_vec(),
            acl: acl.to_vec(),
            mode,
        }
    }

    pub fn delete(path: impl Into<String>, version: i32) -> Self {
        Request::Delete {
            path: path.into(),
            version,
        }
    }

    pub fn exists(path: impl Into<String>, watch: Option<WatchMode>) -> Self {
        Request::Exists {
            path: path.into(),
            watch,
        }
    }

    pub fn get_data(path: impl Into<String>, watch: Option<WatchMode>) -> Self {
        Request::GetData {
            path: path.into(),
            watch,
        }
    }

    pub fn set_data(path: impl Into<String>, data: &[u8], version: i32) -> Self {
        Request::SetData {
            path: path.into(),
            data: data.to_vec(),
            version,
        }
    }

    pub fn get_children(path: impl Into<String>, watch: Option<WatchMode>) -> Self {
        Request::GetChildren {
            path: path.into(),
            watch,
        }
    }

    /// Operation name used in logs and fault rules
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Create { .. } => "create",
            Request::Delete { .. } => "delete",
            Request::Exists { .. } => "exists",
            Request::GetData { .. } => "get_data",
            Request::SetData { .. } => "set_data",
            Request::GetChildren { .. } => "get_children",
            Request::RemoveWatches { .. } => "remove_watches",
            Request::AddAuth { .. } => "add_auth",
            Request::Sync { .. } => "sync",
            Request::CloseSession => "close_session",
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Request::Create { path, .. }
            | Request::Delete { path, .. }
            | Request::Exists { path, .. }
            | Request::GetData { path, .. }
            | Request::SetData { path, .. }
            | Request::GetChildren { path, .. }
            | Request::RemoveWatches { path, .. }
            | Request::Sync { path } => Some(path),
            Request::AddAuth { .. } | Request::CloseSession => None,
        }
    }

    /// Replace the path field, leaving pathless requests untouched.
    pub fn with_path(mut self, new_path: String) -> Self {
        match &mut self {
            Request::Create { path, .. }
            | Request::Delete { path, .. }
            | Request::Exists { path, .. }
            | Request::GetData { path, .. }
            | Request::SetData { path, .. }
            | Request::GetChildren { path, .. }
            | Request::RemoveWatches { path, .. }
            | Request::Sync { path } => *path = new_path,
            Request::AddAuth { .. } | Request::CloseSession => {}
        }
        self
    }

    /// Watch requested alongside a read, with the kind it registers.
    ///
    /// `exists` registers an existence watch; the server decides whether it
    /// ends up as a data or existence watch on its side.
    pub fn watch(&self) -> Option<(WatcherKind, WatchMode)> {
        match self {
            Request::Exists { watch, .. } => watch.map(|m| (WatcherKind::Exist, m)),
            Request::GetData { watch, .. } => watch.map(|m| (WatcherKind::Data, m)),
            Request::GetChildren { watch, .. } => watch.map(|m| (WatcherKind::Child, m)),
            _ => None,
        }
    }
}

/// Successful response from the ensemble
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Response {
    Create { path: String },
    Delete,
    Exists { stat: Option<Stat> },
    GetData { data: Vec<u8>, stat: Stat },
    SetData { stat: Stat },
    GetChildren { children: Vec<String>, stat: Stat },
    RemoveWatches,
    AddAuth,
    Sync { path: String },
    CloseSession,
}

impl Response {
    pub fn op_name(&self) -> &'static str {
        match self {
            Response::Create { .. } => "create",
            Response::Delete => "delete",
            Response::Exists { .. } => "exists",
            Response::GetData { .. } => "get_data",
            Response::SetData { .. } => "set_data",
            Response::GetChildren { .. } => "get_children",
            Response::RemoveWatches => "remove_watches",
            Response::AddAuth => "add_auth",
            Response::Sync { .. } => "sync",
            Response::CloseSession => "close_session",
        }
    }

    /// Map the echoed path of `create`/`sync` responses.
    ///
    /// Child names in `GetChildren` are relative segments and are never mapped.
    pub fn map_path(self, f: impl FnOnce(String) -> String) -> Self {
        match self {
            Response::Create { path } => Response::Create { path: f(path) },
            Response::Sync { path } => Response::Sync { path: f(path) },
            other => other,
        }
    }
}
