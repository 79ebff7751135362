// src/client/request.rs

//! Tracks in-flight requests by request id so asynchronous notifications
//! can be correlated back to their specs.

use super::spec::InvokeSpec;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct RequestManager {
    requests: DashMap<String, Arc<InvokeSpec>>,
}

impl RequestManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push_request(&self, spec: Arc<InvokeSpec>) {
        self.requests.insert(spec.request_id.clone(), spec);
    }

    pub fn get_request(&self, request_id: &str) -> Option<Arc<InvokeSpec>> {
        self.requests.get(request_id).map(|e| e.value().clone())
    }

    pub fn remove_request(&self, request_id: &str) -> Option<Arc<InvokeSpec>> {
        self.requests.remove(request_id).map(|(_, spec)| spec)
    }

    /// Finds the spec that will produce the given return object.
    pub fn find_by_return_id(&self, object_id: &str) -> Option<Arc<InvokeSpec>> {
        self.requests
            .iter()
            .find(|e| e.return_ids.iter().any(|id| id == object_id))
            .map(|e| e.value().clone())
    }

    /// Removes and returns every tracked spec; used at finalize.
    pub fn drain(&self) -> Vec<Arc<InvokeSpec>> {
        let ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove_request(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
