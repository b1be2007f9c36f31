// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Chroot-scoped client namespace layer
//!
//! A [`ChrootSession`] lets application code treat a subtree of the shared
//! namespace as its root. Paths are rewritten on every request, response,
//! error and delivered watch event, while ensemble-global paths such as the
//! configuration node bypass the rewrite.
//!
//! ```no_run
//! use keeper_client::testing::InMemoryEnsemble;
//! use keeper_client::{ChrootSession, SessionConfig, WatchSignal};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let ensemble = InMemoryEnsemble::new();
//! let config = SessionConfig::builder("127.0.0.1:2181/app").build()?;
//! let session = ChrootSession::open(ensemble.connect(), &config, None)?;
//!
//! let created = WatchSignal::new();
//! session.exists("/ready", Some(created.watcher())).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod path;
pub mod session;
pub mod testing;
pub mod watch;
pub mod watchers;

pub use config::{ConfigError, ConnectString, HostPort, SessionConfig, SessionConfigBuilder};
pub use connection::{EventStream, RawConnection, SessionState};
pub use dispatcher::EventDispatcher;
pub use error::{ZkError, ZkResult};
pub use path::{ChrootPrefix, DEFAULT_EXEMPT_PATHS, PathTranslator};
pub use session::ChrootSession;
pub use watch::{WatchId, WatchRegistry, WatchedEvent, Watcher};
pub use watchers::{EventQueue, WaitError, WatchSignal};

pub use keeper_proto::{
    ANY_VERSION, Acl, CONFIG_NODE, CreateMode, EventType, Id, KeeperState, Perms, Request,
    Response, Stat, WatchMode, WatcherEvent, WatcherKind,
};
