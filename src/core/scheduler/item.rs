// src/core/scheduler/item.rs

//! Queue items: the tagged variants the schedule queues carry, each with a
//! request id, priority, cancel tag, failure tag, and schedule promise.

use crate::core::errors::{Status, StatusCode};
use crate::core::instances::InstanceInfo;
use crate::core::resources::SelectorSet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// A cooperative cancellation marker checked at every scheduling step.
#[derive(Debug, Clone, Default)]
pub struct CancelTag {
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelTag {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.reason.lock();
        if guard.is_none() {
            *guard = Some(reason.into());
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// One placement decision for one instance, including any victims that must
/// be evicted first. Carries the placed demand so a rollback can release
/// exactly what was reserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placement {
    pub instance_id: String,
    pub unit_id: String,
    pub owner_id: String,
    pub resources: crate::core::resources::Resources,
    pub labels: Vec<String>,
    pub evicted: Vec<InstanceInfo>,
}

/// The outcome of scheduling one queue item.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleResult {
    pub code: StatusCode,
    pub reason: String,
    pub placements: Vec<Placement>,
}

impl ScheduleResult {
    pub fn success(placements: Vec<Placement>) -> Self {
        ScheduleResult {
            code: StatusCode::Success,
            reason: String::new(),
            placements,
        }
    }

    pub fn failure(code: StatusCode, reason: impl Into<String>) -> Self {
        ScheduleResult {
            code,
            reason: reason.into(),
            placements: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    pub fn status(&self) -> Status {
        Status::new(self.code, self.reason.clone())
    }
}

/// A one-shot promise satisfied when the item's schedule completes.
#[derive(Debug, Default)]
pub struct SchedulePromise {
    sender: Mutex<Option<oneshot::Sender<ScheduleResult>>>,
}

impl SchedulePromise {
    /// Returns the promise and the future observing it.
    pub fn new() -> (Arc<SchedulePromise>, oneshot::Receiver<ScheduleResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(SchedulePromise {
                sender: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Completes the promise; later completions are discarded.
    pub fn complete(&self, result: ScheduleResult) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(result);
        }
    }
}

/// A single instance create/schedule request in a queue.
#[derive(Debug)]
pub struct InstanceItem {
    pub request_id: String,
    pub instance: InstanceInfo,
    pub cancel: CancelTag,
    pub promise: Arc<SchedulePromise>,
    pub enqueued_at: Instant,
    failed: AtomicBool,
    /// Pending required-affinities attached by the fairness policy just
    /// before dispatch.
    pub pending_affinity: Mutex<Vec<SelectorSet>>,
}

impl InstanceItem {
    pub fn new(instance: InstanceInfo) -> (Arc<Self>, oneshot::Receiver<ScheduleResult>) {
        let (promise, rx) = SchedulePromise::new();
        (
            Arc::new(InstanceItem {
                request_id: instance.request_id.clone(),
                instance,
                cancel: CancelTag::new(),
                promise,
                enqueued_at: Instant::now(),
                failed: AtomicBool::new(false),
                pending_affinity: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    pub fn priority(&self) -> u16 {
        self.instance.priority()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.instance.schedule_options.schedule_timeout_ms
    }

    pub fn deadline_exceeded(&self) -> bool {
        let timeout = self.timeout_ms();
        timeout != 0 && self.enqueued_at.elapsed().as_millis() as u64 >= timeout
    }

    pub fn tag_failure(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Group-level options carried by a group schedule request.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GroupOptions {
    #[serde(rename = "groupname", default)]
    pub group_name: String,
    #[serde(rename = "samerunninglifecycle", default)]
    pub same_lifecycle: bool,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(rename = "bundlesize", default)]
    pub bundle_size: usize,
    #[serde(rename = "totalsize", default)]
    pub total_size: usize,
    /// Range groups carry one body request fanned out server-side.
    #[serde(rename = "isrange", default)]
    pub is_range: bool,
}

/// A group schedule request: all members place together or not at all.
#[derive(Debug)]
pub struct GroupScheduleItem {
    pub request_id: String,
    pub group_id: String,
    pub options: GroupOptions,
    pub members: Vec<Arc<InstanceItem>>,
    pub cancel: CancelTag,
    pub promise: Arc<SchedulePromise>,
    pub enqueued_at: Instant,
    failed: AtomicBool,
}

impl GroupScheduleItem {
    pub fn new(
        request_id: String,
        group_id: String,
        options: GroupOptions,
        members: Vec<InstanceInfo>,
    ) -> (Arc<Self>, oneshot::Receiver<ScheduleResult>) {
        let (promise, rx) = SchedulePromise::new();
        let members = members
            .into_iter()
            .map(|m| InstanceItem::new(m).0)
            .collect();
        (
            Arc::new(GroupScheduleItem {
                request_id,
                group_id,
                options,
                members,
                cancel: CancelTag::new(),
                promise,
                enqueued_at: Instant::now(),
                failed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn priority(&self) -> u16 {
        self.members.first().map(|m| m.priority()).unwrap_or(0)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.options.timeout_ms
    }

    pub fn tag_failure(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// A FIFO of same-priority, same-shape instance requests collapsed into one
/// queue slot by the aggregating queue.
#[derive(Debug)]
pub struct AggregatedItem {
    /// function urn + serialized resource shape + priority.
    pub aggregate_key: String,
    pub priority: u16,
    pub requests: Mutex<VecDeque<Arc<InstanceItem>>>,
}

impl AggregatedItem {
    pub fn new(aggregate_key: String, priority: u16) -> Self {
        AggregatedItem {
            aggregate_key,
            priority,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: Arc<InstanceItem>) {
        self.requests.lock().push_back(item);
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// The first request id, for logging.
    pub fn request_id(&self) -> String {
        self.requests
            .lock()
            .front()
            .map(|i| i.request_id.clone())
            .unwrap_or_default()
    }
}

/// The tagged variant the schedule queues carry.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Instance(Arc<InstanceItem>),
    Group(Arc<GroupScheduleItem>),
    Aggregated(Arc<AggregatedItem>),
}

impl QueueItem {
    pub fn request_id(&self) -> String {
        match self {
            QueueItem::Instance(i) => i.request_id.clone(),
            QueueItem::Group(g) => g.request_id.clone(),
            QueueItem::Aggregated(a) => a.request_id(),
        }
    }

    pub fn priority(&self) -> u16 {
        match self {
            QueueItem::Instance(i) => i.priority(),
            QueueItem::Group(g) => g.priority(),
            QueueItem::Aggregated(a) => a.priority,
        }
    }

    pub fn is_canceled(&self) -> bool {
        match self {
            QueueItem::Instance(i) => i.cancel.is_canceled(),
            QueueItem::Group(g) => g.cancel.is_canceled(),
            // Aggregates are peeled per-request; cancellation is per member.
            QueueItem::Aggregated(_) => false,
        }
    }
}
