//! Block cache and daemon for databases stored in cloud containers.
//!
//! This crate provides:
//! - The local block cache (slot index with LRU and pinning) and cache file
//! - The dispatcher that bounds and retries storage requests
//! - Container lifecycle: attach, poll, upload, copy, delete, revert, cleanup
//! - The per-container key-value store
//! - The client/daemon wire protocol, the daemon and its client
//! - The daemonless [`Embedded`] API

pub mod auth;
pub mod cache;
pub mod cachefile;
pub mod cleanup;
pub mod client;
pub mod container;
pub mod daemon;
pub mod dispatch;
pub mod embedded;
pub mod engine;
pub mod error;
pub mod kv;
pub mod lifecycle;
pub mod protocol;
pub mod vtab;

pub use auth::{AuthProvider, AuthTarget, StaticAuth};
pub use cleanup::CleanupStats;
pub use client::{DaemonClient, HelloInfo, PrefetchStatus};
pub use container::{Container, ContainerState, Deferred};
pub use daemon::DaemonHandle;
pub use embedded::Embedded;
pub use engine::{Engine, EngineEvent};
pub use error::{BcvError, BcvResult};
pub use kv::KvStore;
pub use lifecycle::{Attaching, PrefetchStats, UploadStats};
pub use protocol::{ATTACH_IFNOT, ATTACH_READONLY, ATTACH_SECURE, BcvCodec, Message};
