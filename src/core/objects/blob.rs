// src/core/objects/blob.rs

//! The data-plane blob store contract: content-addressed byte storage with
//! reference counting. The network-backed implementation is an external
//! collaborator; the in-memory one below backs tests and single-node runs.

use crate::core::errors::StratusError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, id: &str, data: Bytes) -> Result<(), StratusError>;

    async fn get(&self, id: &str) -> Result<Bytes, StratusError>;

    async fn contains(&self, id: &str) -> bool;

    async fn increase_ref(&self, ids: &[String]) -> Result<(), StratusError>;

    /// Decrements; entries reaching zero are deleted.
    async fn decrease_ref(&self, ids: &[String]) -> Result<(), StratusError>;
}

#[derive(Debug)]
struct BlobEntry {
    data: Bytes,
    refs: i64,
}

/// In-memory blob store with per-entry reference counts.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    entries: DashMap<String, BlobEntry>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, id: &str, data: Bytes) -> Result<(), StratusError> {
        // Promotion is idempotent; a re-put refreshes the payload only.
        self.entries
            .entry(id.to_string())
            .and_modify(|e| e.data = data.clone())
            .or_insert(BlobEntry { data, refs: 1 });
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Bytes, StratusError> {
        self.entries
            .get(id)
            .map(|e| e.data.clone())
            .ok_or_else(|| StratusError::ObjectNotFound(id.to_string()))
    }

    async fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    async fn increase_ref(&self, ids: &[String]) -> Result<(), StratusError> {
        for id in ids {
            if let Some(mut entry) = self.entries.get_mut(id) {
                entry.refs += 1;
            }
        }
        Ok(())
    }

    async fn decrease_ref(&self, ids: &[String]) -> Result<(), StratusError> {
        for id in ids {
            let remove = match self.entries.get_mut(id) {
                Some(mut entry) => {
                    entry.refs -= 1;
                    entry.refs <= 0
                }
                None => false,
            };
            if remove {
                self.entries.remove(id);
            }
        }
        Ok(())
    }
}
