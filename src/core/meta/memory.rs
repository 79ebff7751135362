// src/core/meta/memory.rs

//! An in-memory, revisioned implementation of the metadata-store contract.
//! Used by single-cluster deployments and by every test; an etcd-backed
//! implementation plugs in behind the same trait.

use super::{
    GetOptions, GetResponse, KeyValue, MetaStore, SyncResult, WatchEvent, WatchEventType,
    WatchOptions, Watcher,
};
use crate::core::errors::StratusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

const WATCH_BUS_CAPACITY: usize = 4096;
const WATCH_BATCH_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    mod_revision: i64,
    lease: Option<i64>,
}

#[derive(Default)]
struct StoreInner {
    kvs: BTreeMap<String, StoredValue>,
    revision: i64,
    next_lease: i64,
    leases: HashMap<i64, Vec<String>>,
}

/// The in-memory store: a revisioned BTreeMap guarded by a short-held mutex,
/// with watch fan-out over a broadcast bus that per-watcher forwarders
/// filter by prefix and revision.
pub struct MemoryMetaStore {
    inner: Mutex<StoreInner>,
    watch_bus: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        let (watch_bus, _) = broadcast::channel(WATCH_BUS_CAPACITY);
        MemoryMetaStore {
            inner: Mutex::new(StoreInner::default()),
            watch_bus,
        }
    }

    fn publish(&self, event: WatchEvent) {
        // No subscribers is fine; watchers may not have started yet.
        let _ = self.watch_bus.send(event);
    }

    fn matches(key: &str, watched: &str, prefix: bool) -> bool {
        if prefix {
            key.starts_with(watched)
        } else {
            key == watched
        }
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<i64>,
    ) -> Result<i64, StratusError> {
        let (event, revision) = {
            let mut inner = self.inner.lock();
            inner.revision += 1;
            let revision = inner.revision;
            let prev = inner.kvs.insert(
                key.to_string(),
                StoredValue {
                    value: value.to_string(),
                    mod_revision: revision,
                    lease,
                },
            );
            if let Some(lease) = lease {
                inner.leases.entry(lease).or_default().push(key.to_string());
            }
            let event = WatchEvent {
                event_type: WatchEventType::Put,
                kv: KeyValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    mod_revision: revision,
                },
                prev_kv: prev.map(|p| KeyValue {
                    key: key.to_string(),
                    value: p.value,
                    mod_revision: p.mod_revision,
                }),
            };
            (event, revision)
        };
        self.publish(event);
        Ok(revision)
    }

    async fn put_if_revision(
        &self,
        key: &str,
        value: &str,
        expected: i64,
    ) -> Result<bool, StratusError> {
        let current = {
            let inner = self.inner.lock();
            inner.kvs.get(key).map(|v| v.mod_revision).unwrap_or(0)
        };
        if current != expected {
            debug!(
                "meta CAS miss on {}: expected revision {}, found {}",
                key, expected, current
            );
            return Ok(false);
        }
        self.put(key, value, None).await?;
        Ok(true)
    }

    async fn get(&self, key: &str, opts: GetOptions) -> Result<GetResponse, StratusError> {
        let inner = self.inner.lock();
        let mut kvs = Vec::new();
        if opts.prefix {
            for (k, v) in inner.kvs.range(key.to_string()..) {
                if !k.starts_with(key) {
                    break;
                }
                kvs.push(KeyValue {
                    key: k.clone(),
                    value: v.value.clone(),
                    mod_revision: v.mod_revision,
                });
                if opts.limit != 0 && kvs.len() >= opts.limit {
                    break;
                }
            }
        } else if let Some(v) = inner.kvs.get(key) {
            kvs.push(KeyValue {
                key: key.to_string(),
                value: v.value.clone(),
                mod_revision: v.mod_revision,
            });
        }
        Ok(GetResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StratusError> {
        let event = {
            let mut inner = self.inner.lock();
            let Some(prev) = inner.kvs.remove(key) else {
                return Ok(false);
            };
            inner.revision += 1;
            let revision = inner.revision;
            WatchEvent {
                event_type: WatchEventType::Delete,
                kv: KeyValue {
                    key: key.to_string(),
                    value: String::new(),
                    mod_revision: revision,
                },
                prev_kv: Some(KeyValue {
                    key: key.to_string(),
                    value: prev.value,
                    mod_revision: prev.mod_revision,
                }),
            }
        };
        self.publish(event);
        Ok(true)
    }

    async fn watch(&self, key: &str, opts: WatchOptions) -> Result<Watcher, StratusError> {
        let mut bus_rx = self.watch_bus.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BATCH_CAPACITY);
        let watched = key.to_string();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(event) => {
                        if !MemoryMetaStore::matches(&event.kv.key, &watched, opts.prefix) {
                            continue;
                        }
                        if event.kv.mod_revision < opts.revision {
                            continue;
                        }
                        let mut event = event;
                        if !opts.prev_kv {
                            event.prev_kv = None;
                        }
                        if tx.send(vec![event]).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("watch on {} lagged by {} events, watcher must resync", watched, missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Watcher { events: rx })
    }

    async fn sync(&self, prefix: &str) -> Result<SyncResult, StratusError> {
        let response = self
            .get(
                prefix,
                GetOptions {
                    prefix: true,
                    limit: 0,
                },
            )
            .await?;
        Ok(SyncResult {
            kvs: response.kvs,
            revision: response.revision + 1,
        })
    }

    async fn grant(&self, _ttl_secs: i64) -> Result<i64, StratusError> {
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let lease = inner.next_lease;
        inner.leases.insert(lease, Vec::new());
        Ok(lease)
    }

    async fn revoke(&self, lease: i64) -> Result<(), StratusError> {
        let keys = {
            let mut inner = self.inner.lock();
            inner.leases.remove(&lease).unwrap_or_default()
        };
        for key in keys {
            self.delete(&key).await?;
        }
        Ok(())
    }
}
