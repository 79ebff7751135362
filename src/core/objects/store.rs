// src/core/objects/store.rs

//! The in-memory object tier of the content-addressed object store, with
//! global reference counting, one-shot ready/error transitions, nested-id
//! tracking, and optional promotion into the data-plane blob store.
//!
//! Object details are values in an intrusive map guarded per-entry; no
//! handle to a detail is held across a suspension point, every access
//! re-looks the entry up under the map's lock.

use super::blob::BlobStore;
use super::waiting::{WaitManager, WaitResult};
use crate::core::errors::{Status, StatusCode, StratusError};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Invoked when an object transitions out of unready; `None` means ready,
/// `Some(status)` carries the error.
pub type ReadyCallback = Box<dyn FnOnce(Option<Status>) + Send>;

/// Per-object state. Only the return values of create/invoke start unready;
/// everything else is born ready.
#[derive(Default)]
struct ObjectDetail {
    data: Option<Bytes>,
    global_ref: i64,
    local_ref: i64,
    in_datastore: bool,
    ready: bool,
    err: Option<Status>,
    nested: HashSet<String>,
    callbacks: Vec<ReadyCallback>,
    instance_ids: Option<Vec<String>>,
    /// Which remote peer contributed each reference, for peer-death cleanup.
    remote_refs: HashMap<String, i64>,
}

/// The object store client. Shared between the invoke adaptor, the waiting
/// manager, and the notification path.
pub struct ObjectStore {
    details: DashMap<String, Mutex<ObjectDetail>>,
    /// request id → object ids bound to that request's scope.
    req_bindings: Mutex<HashMap<String, Vec<String>>>,
    wait_mgr: Arc<WaitManager>,
    blob: Option<Arc<dyn BlobStore>>,
}

impl ObjectStore {
    pub fn new(wait_mgr: Arc<WaitManager>) -> Self {
        ObjectStore {
            details: DashMap::new(),
            req_bindings: Mutex::new(HashMap::new()),
            wait_mgr,
            blob: None,
        }
    }

    pub fn with_blob_store(mut self, blob: Arc<dyn BlobStore>) -> Self {
        self.blob = Some(blob);
        self
    }

    pub fn wait_manager(&self) -> Arc<WaitManager> {
        self.wait_mgr.clone()
    }

    /// Produces a fresh object id under the given prefix.
    pub fn generate_key(&self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }

    /// Registers an unready placeholder for a return object. The object is
    /// born with one global reference held by the registering request.
    pub fn add_return_object(&self, id: &str) -> Result<(), StratusError> {
        if self.details.contains_key(id) {
            return Err(StratusError::Parameter(format!(
                "return object {id} already registered"
            )));
        }
        let detail = ObjectDetail {
            global_ref: 1,
            ready: false,
            ..Default::default()
        };
        self.details.insert(id.to_string(), Mutex::new(detail));
        self.wait_mgr.set_unready(id);
        Ok(())
    }

    /// Whether `candidate`'s recorded nested closure reaches `root`.
    fn nested_reaches(&self, root: &str, candidate: &str, seen: &mut HashSet<String>) -> bool {
        if candidate == root {
            return true;
        }
        if !seen.insert(candidate.to_string()) {
            return false;
        }
        let children = match self.details.get(candidate) {
            Some(entry) => entry.lock().nested.iter().cloned().collect::<Vec<_>>(),
            None => return false,
        };
        children
            .iter()
            .any(|child| self.nested_reaches(root, child, seen))
    }

    /// Stores a payload under an already-owned id. Fails when no reference
    /// exists (nobody declared ownership) or the nested set would contain
    /// the id itself, directly or transitively.
    pub async fn put(
        &self,
        id: &str,
        data: Bytes,
        nested: HashSet<String>,
        to_datastore: bool,
    ) -> Result<(), StratusError> {
        let mut seen = HashSet::new();
        for child in &nested {
            if self.nested_reaches(id, child, &mut seen) {
                return Err(StratusError::CircularNestedRef(id.to_string()));
            }
        }
        {
            let entry = self
                .details
                .get(id)
                .ok_or_else(|| StratusError::ZeroReference(id.to_string()))?;
            let mut detail = entry.lock();
            if detail.global_ref <= 0 {
                return Err(StratusError::ZeroReference(id.to_string()));
            }
            detail.data = Some(data.clone());
            detail.nested = nested;
        }
        if to_datastore {
            self.promote(id, data).await?;
        }
        Ok(())
    }

    /// Promotes an object's payload into the blob store. Idempotent and
    /// id-preserving.
    async fn promote(&self, id: &str, data: Bytes) -> Result<(), StratusError> {
        let Some(blob) = &self.blob else {
            return Err(StratusError::Internal(
                "no datastore configured for object promotion".to_string(),
            ));
        };
        let already = {
            match self.details.get(id) {
                Some(entry) => entry.lock().in_datastore,
                None => false,
            }
        };
        if already {
            return Ok(());
        }
        blob.put(id, data).await?;
        if let Some(entry) = self.details.get(id) {
            entry.lock().in_datastore = true;
        }
        Ok(())
    }

    /// Fetches a single object, blocking until ready-or-error or timeout.
    pub async fn get(&self, id: &str, timeout_ms: i64) -> Result<Bytes, Status> {
        let ids = [id.to_string()];
        let result = self
            .wait_mgr
            .wait_until_ready(self, &ids, 1, timeout_ms)
            .await;
        if let Some(status) = result.errors.get(id) {
            return Err(status.clone());
        }
        if !result.ready.iter().any(|r| r == id) {
            return Err(Status::new(
                StatusCode::RequestTimeOut,
                format!("object {id} not ready within {timeout_ms}ms"),
            ));
        }
        self.read_payload(id).await
    }

    /// Fetches a batch; per-id buffer or error, in input order.
    pub async fn get_many(
        &self,
        ids: &[String],
        timeout_ms: i64,
    ) -> Vec<(String, Result<Bytes, Status>)> {
        let wait = self
            .wait_mgr
            .wait_until_ready(self, ids, ids.len(), timeout_ms)
            .await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(status) = wait.errors.get(id) {
                out.push((id.clone(), Err(status.clone())));
            } else if wait.ready.iter().any(|r| r == id) {
                out.push((id.clone(), self.read_payload(id).await));
            } else {
                out.push((
                    id.clone(),
                    Err(Status::new(
                        StatusCode::RequestTimeOut,
                        format!("object {id} not ready within {timeout_ms}ms"),
                    )),
                ));
            }
        }
        out
    }

    /// Waits on a set of ids with a minimum-ready threshold.
    pub async fn wait(&self, ids: &[String], min_ready: usize, timeout_ms: i64) -> WaitResult {
        self.wait_mgr
            .wait_until_ready(self, ids, min_ready, timeout_ms)
            .await
    }

    /// Reads the payload from memory, falling back to the blob store.
    async fn read_payload(&self, id: &str) -> Result<Bytes, Status> {
        let (data, in_datastore) = match self.details.get(id) {
            Some(entry) => {
                let detail = entry.lock();
                (detail.data.clone(), detail.in_datastore)
            }
            None => (None, false),
        };
        if let Some(data) = data {
            return Ok(data);
        }
        if in_datastore {
            if let Some(blob) = &self.blob {
                return blob.get(id).await.map_err(Status::from);
            }
        }
        Err(Status::new(
            StatusCode::InnerSystemError,
            format!("object {id} is ready but has no payload"),
        ))
    }

    /// Increments global references; ids unseen before are created ready.
    pub fn increase_global_reference(&self, ids: &[String]) {
        for id in ids {
            let entry = self
                .details
                .entry(id.clone())
                .or_insert_with(|| {
                    Mutex::new(ObjectDetail {
                        ready: true,
                        ..Default::default()
                    })
                });
            entry.lock().global_ref += 1;
        }
    }

    /// Increments references on behalf of a remote peer, recording the peer
    /// so its death can bulk-release.
    pub fn increase_global_reference_remote(&self, ids: &[String], remote_id: &str) {
        self.increase_global_reference(ids);
        for id in ids {
            if let Some(entry) = self.details.get(id) {
                *entry
                    .lock()
                    .remote_refs
                    .entry(remote_id.to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    /// Decrements global references; ids reaching zero are dropped from the
    /// store (and the blob store, when promoted) and returned. Nested ids
    /// of a dropped object are released recursively.
    pub fn decrease_global_reference(&self, ids: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        let mut queue: Vec<String> = ids.to_vec();
        let mut blob_release = Vec::new();
        while let Some(id) = queue.pop() {
            let drop_entry = match self.details.get(&id) {
                Some(entry) => {
                    let mut detail = entry.lock();
                    if detail.global_ref <= 0 {
                        warn!("decrement on object {} with no references", id);
                        false
                    } else {
                        detail.global_ref -= 1;
                        detail.global_ref == 0
                    }
                }
                None => false,
            };
            if drop_entry {
                if let Some((_, entry)) = self.details.remove(&id) {
                    let detail = entry.into_inner();
                    queue.extend(detail.nested.iter().cloned());
                    if detail.in_datastore {
                        blob_release.push(id.clone());
                    }
                }
                removed.push(id);
            }
        }
        if !blob_release.is_empty() {
            if let Some(blob) = self.blob.clone() {
                tokio::spawn(async move {
                    let _ = blob.decrease_ref(&blob_release).await;
                });
            }
        }
        removed
    }

    /// Releases every reference a dead peer contributed.
    pub fn decrease_references_of_remote(&self, remote_id: &str) -> Vec<String> {
        let mut to_release = Vec::new();
        for entry in self.details.iter() {
            let mut detail = entry.lock();
            if let Some(count) = detail.remote_refs.remove(remote_id) {
                for _ in 0..count {
                    to_release.push(entry.key().clone());
                }
            }
        }
        self.decrease_global_reference(&to_release)
    }

    pub fn query_global_reference(&self, ids: &[String]) -> Vec<i64> {
        ids.iter()
            .map(|id| {
                self.details
                    .get(id)
                    .map(|entry| entry.lock().global_ref)
                    .unwrap_or(0)
            })
            .collect()
    }

    /// One-shot unready → ready transition. A second call, or a call after
    /// `set_error`, is a no-op returning false.
    pub fn set_ready(&self, id: &str) -> bool {
        let callbacks = {
            let Some(entry) = self.details.get(id) else {
                return false;
            };
            let mut detail = entry.lock();
            if detail.ready || detail.err.is_some() {
                return false;
            }
            detail.ready = true;
            std::mem::take(&mut detail.callbacks)
        };
        for cb in callbacks {
            cb(None);
        }
        self.wait_mgr.set_ready(id);
        debug!("object {} is ready", id);
        true
    }

    /// One-shot transition to error. Later `set_ready` calls are ignored;
    /// `get` keeps surfacing the error even if data appears afterwards.
    pub fn set_error(&self, id: &str, status: Status) -> bool {
        let callbacks = {
            let Some(entry) = self.details.get(id) else {
                return false;
            };
            let mut detail = entry.lock();
            if detail.err.is_some() {
                return false;
            }
            detail.err = Some(status.clone());
            detail.ready = false;
            std::mem::take(&mut detail.callbacks)
        };
        for cb in callbacks {
            cb(Some(status.clone()));
        }
        self.wait_mgr.set_error(id, &status);
        true
    }

    /// Registers a completion callback; fires immediately when the object
    /// has already settled.
    pub fn add_ready_callback(&self, id: &str, cb: ReadyCallback) -> bool {
        let settled = {
            let Some(entry) = self.details.get(id) else {
                return false;
            };
            let mut detail = entry.lock();
            if detail.err.is_some() {
                Some(detail.err.clone())
            } else if detail.ready {
                Some(None)
            } else {
                detail.callbacks.push(cb);
                return true;
            }
        };
        if let Some(status) = settled {
            cb(status);
        }
        true
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.details
            .get(id)
            .map(|entry| entry.lock().ready)
            .unwrap_or(false)
    }

    /// The last recorded error for an id; OK when none.
    pub fn get_last_error(&self, id: &str) -> Status {
        self.details
            .get(id)
            .and_then(|entry| entry.lock().err.clone())
            .unwrap_or_else(Status::ok)
    }

    /// Binds the instance ids materialized for a create/group request to
    /// its return object.
    pub fn set_instance_ids(&self, id: &str, instance_ids: Vec<String>) -> bool {
        match self.details.get(id) {
            Some(entry) => {
                entry.lock().instance_ids = Some(instance_ids);
                true
            }
            None => false,
        }
    }

    pub fn get_instance_ids(&self, id: &str) -> Option<Vec<String>> {
        self.details.get(id).and_then(|e| e.lock().instance_ids.clone())
    }

    /// Waits until the object settles, then returns its bound instance ids.
    pub async fn wait_instance_ids(
        &self,
        id: &str,
        timeout_ms: i64,
    ) -> Result<Vec<String>, Status> {
        let ids = [id.to_string()];
        let result = self
            .wait_mgr
            .wait_until_ready(self, &ids, 1, timeout_ms)
            .await;
        if let Some(status) = result.errors.get(id) {
            return Err(status.clone());
        }
        if !result.ready.iter().any(|r| r == id) {
            return Err(Status::new(
                StatusCode::RequestTimeOut,
                format!("instance ids of {id} not bound within {timeout_ms}ms"),
            ));
        }
        self.get_instance_ids(id).ok_or_else(|| {
            Status::new(
                StatusCode::InnerSystemError,
                format!("object {id} ready without instance ids"),
            )
        })
    }

    /// Scopes a set of object ids to a request so a retry or group teardown
    /// can bulk-release them regardless of callback ordering.
    pub fn bind_obj_ref_in_req(&self, request_id: &str, ids: &[String]) {
        let mut bindings = self.req_bindings.lock();
        bindings
            .entry(request_id.to_string())
            .or_default()
            .extend(ids.iter().cloned());
    }

    /// Releases a request's scope, returning the ids that were bound.
    pub fn unbind_obj_ref_in_req(&self, request_id: &str) -> Vec<String> {
        self.req_bindings
            .lock()
            .remove(request_id)
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.details.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.details.len()
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }
}
