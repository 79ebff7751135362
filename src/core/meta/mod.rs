// src/core/meta/mod.rs

//! The metadata-store contract: a consistent KV with watch, lease, and
//! compare-and-swap, consumed by the group manager and the recovery path.
//! The store is the single serialization point of the control plane; no
//! distributed transactions exist beyond it.

pub mod memory;

use crate::core::errors::StratusError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use memory::MemoryMetaStore;

/// Key prefix for persisted group info.
pub const GROUP_PATH_PREFIX: &str = "/sn/group/";
/// Key prefix for persisted instance info.
pub const INSTANCE_PATH_PREFIX: &str = "/sn/instance/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub mod_revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Put,
    Delete,
}

/// One change observed by a watcher. `prev_kv` carries the overwritten or
/// deleted value when the watch asked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub prefix: bool,
    /// 0 means unlimited.
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub prefix: bool,
    pub prev_kv: bool,
    /// Deliver events with a revision at or after this value.
    pub revision: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// The result of a watcher resync: the keys as they exist now plus the next
/// revision to watch from. Keys cached by the watcher but absent here must
/// be treated as deleted.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// A live watch: a batched event stream plus its cancel guard. Dropping the
/// watcher stops delivery.
pub struct Watcher {
    pub events: mpsc::Receiver<Vec<WatchEvent>>,
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Writes a key, optionally bound to a lease. Returns the new revision.
    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<i64>,
    ) -> Result<i64, StratusError>;

    /// Compare-and-swap: writes only when the key's current mod revision
    /// matches `expected` (0 for "must not exist"). Returns false on a
    /// revision mismatch so the caller can re-read and retry.
    async fn put_if_revision(
        &self,
        key: &str,
        value: &str,
        expected: i64,
    ) -> Result<bool, StratusError>;

    async fn get(&self, key: &str, opts: GetOptions) -> Result<GetResponse, StratusError>;

    /// Deletes a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StratusError>;

    /// Starts a watch on `key` (or the prefix) from `opts.revision`.
    async fn watch(&self, key: &str, opts: WatchOptions) -> Result<Watcher, StratusError>;

    /// Re-reads the prefix for a watcher that fell behind.
    async fn sync(&self, prefix: &str) -> Result<SyncResult, StratusError>;

    /// Grants a lease with the given TTL in seconds; returns the lease id.
    async fn grant(&self, ttl_secs: i64) -> Result<i64, StratusError>;

    /// Revokes a lease, deleting every key bound to it.
    async fn revoke(&self, lease: i64) -> Result<(), StratusError>;
}
