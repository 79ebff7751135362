// src/core/scheduler/recorder.rs

//! Remembers the last schedule error per request id, so a request that
//! finally times out in the pending queue can report why it was parked.

use crate::core::errors::Status;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct ScheduleRecorder {
    errors: DashMap<String, Status>,
}

impl ScheduleRecorder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_schedule_err(&self, request_id: &str, status: Status) {
        self.errors.insert(request_id.to_string(), status);
    }

    pub fn erase_schedule_err(&self, request_id: &str) {
        self.errors.remove(request_id);
    }

    pub fn last_schedule_err(&self, request_id: &str) -> Option<Status> {
        self.errors.get(request_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}
