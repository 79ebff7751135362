// src/core/scheduler/scheduler.rs

//! The priority scheduler control loop: a running queue consumed every
//! resource-view tick and a pending queue holding items parked behind
//! similar-demand predecessors, re-activated at the start of each tick.

use super::context::PreAllocatedContext;
use super::item::{GroupScheduleItem, InstanceItem, QueueItem, ScheduleResult};
use super::performer::SchedulePerformer;
use super::policy::{FairnessPolicy, FifoPolicy, PriorityPolicy, PriorityPolicyKind};
use super::queue::{AggregatedQueue, ScheduleQueue, TimeSortedQueue};
use super::recorder::ScheduleRecorder;
use crate::core::errors::{Status, StatusCode};
use crate::core::resources::view::ResourceViewInfo;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn make_queue(aggregate: bool) -> Box<dyn ScheduleQueue> {
    if aggregate {
        Box::new(AggregatedQueue::new())
    } else {
        Box::new(TimeSortedQueue::new())
    }
}

fn make_policy(kind: PriorityPolicyKind) -> Box<dyn PriorityPolicy> {
    match kind {
        PriorityPolicyKind::Fifo => Box::new(FifoPolicy),
        PriorityPolicyKind::Fairness => Box::new(FairnessPolicy::new()),
    }
}

pub struct PriorityScheduler {
    running: Box<dyn ScheduleQueue>,
    pending: Box<dyn ScheduleQueue>,
    policy: Box<dyn PriorityPolicy>,
    performer: Arc<dyn SchedulePerformer>,
    recorder: Arc<ScheduleRecorder>,
    view_info: ResourceViewInfo,
    pre_ctx: PreAllocatedContext,
    aggregate: bool,
    /// request id (and group id) → the item, for cancellation.
    cancel_index: HashMap<String, QueueItem>,
}

impl PriorityScheduler {
    pub fn new(
        policy_kind: PriorityPolicyKind,
        aggregate: bool,
        performer: Arc<dyn SchedulePerformer>,
        recorder: Arc<ScheduleRecorder>,
    ) -> Self {
        debug!(
            "priority scheduler created, policy {:?}, aggregate {}",
            policy_kind, aggregate
        );
        PriorityScheduler {
            running: make_queue(aggregate),
            pending: make_queue(aggregate),
            policy: make_policy(policy_kind),
            performer,
            recorder,
            view_info: ResourceViewInfo::default(),
            pre_ctx: PreAllocatedContext::default(),
            aggregate,
            cancel_index: HashMap::new(),
        }
    }

    /// Admits a new item: straight to running unless the policy sees a
    /// similar pending request.
    pub fn enqueue(&mut self, item: QueueItem) {
        self.index_for_cancel(&item);
        if !self.policy.can_schedule(&item) {
            debug!(
                "{}|similar pending request exists, push to pending queue",
                item.request_id()
            );
            self.pending.enqueue(item);
        } else {
            self.running.enqueue(item);
        }
    }

    fn index_for_cancel(&mut self, item: &QueueItem) {
        self.cancel_index.insert(item.request_id(), item.clone());
        if let QueueItem::Group(group) = item {
            self.cancel_index
                .insert(group.group_id.clone(), item.clone());
        }
    }

    fn unindex(&mut self, item: &QueueItem) {
        self.cancel_index.remove(&item.request_id());
        if let QueueItem::Group(group) = item {
            self.cancel_index.remove(&group.group_id);
        }
    }

    /// Cancels a queued request or group by id. The item stays queued; the
    /// loop discards it (with rollback if it already scheduled).
    pub fn try_cancel(&mut self, id: &str, reason: &str) -> bool {
        match self.cancel_index.get(id) {
            Some(QueueItem::Instance(instance)) => {
                instance.cancel.cancel(reason);
                true
            }
            Some(QueueItem::Group(group)) => {
                group.cancel.cancel(reason);
                for member in &group.members {
                    member.cancel.cancel(reason);
                }
                true
            }
            Some(QueueItem::Aggregated(_)) | None => false,
        }
    }

    /// Moves pending requests into the running queue: pending items outrank
    /// running items of the same priority, so pending absorbs running and
    /// takes its place.
    pub fn activate_pending_requests(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.pending.extend(self.running.as_mut());
        self.running = std::mem::replace(&mut self.pending, make_queue(self.aggregate));
        self.policy.clear_pending_infos();
    }

    /// Installs the snapshot for this tick and resets the pre-allocated
    /// context.
    pub fn handle_resource_info_update(&mut self, info: ResourceViewInfo) {
        self.pre_ctx = PreAllocatedContext::new(info.all_local_labels.clone());
        self.view_info = info;
    }

    pub fn running_is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drains the running queue for this tick.
    pub fn consume_running_queue(&mut self) {
        while !self.running.is_empty() {
            self.do_consume();
        }
    }

    fn do_consume(&mut self) {
        let Some(item) = self.running.front() else {
            warn!("running queue front is empty");
            return;
        };
        if item.is_canceled() {
            warn!(
                "{}|schedule is canceled, reason: {}",
                item.request_id(),
                cancel_reason(&item)
            );
            self.finish_canceled(&item);
            self.running.dequeue();
            return;
        }
        if self.expire_if_overdue(&item) {
            self.running.dequeue();
            return;
        }
        if !self.policy.can_schedule(&item) {
            debug!(
                "{}|similar pending request exists, push to pending queue",
                item.request_id()
            );
            self.running.dequeue();
            self.pending.enqueue(item);
            return;
        }
        self.policy.prepare_for_scheduling(&item);
        match &item {
            QueueItem::Instance(instance) => {
                info!("{}|start instance schedule", instance.request_id);
                let result = self.performer.schedule_instance(
                    &mut self.pre_ctx,
                    &self.view_info,
                    instance,
                );
                self.on_instance_schedule_done(instance.clone(), result);
            }
            QueueItem::Group(group) => {
                info!("{}|start group schedule", group.request_id);
                if group.members.is_empty() {
                    warn!("{}|group schedule requests are empty", group.request_id);
                    group.promise.complete(ScheduleResult::success(Vec::new()));
                    self.unindex(&item);
                } else {
                    let result = self.performer.schedule_group(
                        &mut self.pre_ctx,
                        &self.view_info,
                        group,
                    );
                    self.on_group_schedule_done(group.clone(), result);
                }
            }
            QueueItem::Aggregated(aggregated) => {
                info!(
                    "start aggregated schedule (reqId={}, priority={}, size={})",
                    aggregated.request_id(),
                    aggregated.priority,
                    aggregated.len()
                );
                self.consume_aggregated(aggregated);
            }
        }
        self.running.dequeue();
    }

    /// Peels an aggregate one request at a time; canceled requests are
    /// discarded, the rest are scheduled in FIFO order.
    fn consume_aggregated(&mut self, aggregated: &Arc<super::item::AggregatedItem>) {
        loop {
            let next = aggregated.requests.lock().pop_front();
            let Some(instance) = next else {
                break;
            };
            if instance.cancel.is_canceled() {
                warn!(
                    "schedule (reqId={}) is canceled, reason: {}",
                    instance.request_id,
                    instance.cancel.reason().unwrap_or_default()
                );
                self.finish_canceled(&QueueItem::Instance(instance));
                continue;
            }
            if self.expire_if_overdue(&QueueItem::Instance(instance.clone())) {
                continue;
            }
            let result =
                self.performer
                    .schedule_instance(&mut self.pre_ctx, &self.view_info, &instance);
            self.on_instance_schedule_done(instance, result);
        }
    }

    /// Completes an overdue item with the last recorded schedule error (or
    /// a bare timeout). Returns true when the item was consumed.
    fn expire_if_overdue(&mut self, item: &QueueItem) -> bool {
        let QueueItem::Instance(instance) = item else {
            return false;
        };
        if !instance.deadline_exceeded() {
            return false;
        }
        let status = self
            .recorder
            .last_schedule_err(&instance.request_id)
            .unwrap_or_else(|| {
                Status::new(StatusCode::RequestTimeOut, "schedule timeout in pending queue")
            });
        warn!(
            "{}|schedule deadline exceeded, finishing with {}: {}",
            instance.request_id, status.code, status.message
        );
        self.recorder.erase_schedule_err(&instance.request_id);
        instance
            .promise
            .complete(ScheduleResult::failure(StatusCode::RequestTimeOut, status.message));
        self.unindex(item);
        true
    }

    fn finish_canceled(&mut self, item: &QueueItem) {
        let reason = cancel_reason(item);
        match item {
            QueueItem::Instance(instance) => instance
                .promise
                .complete(ScheduleResult::failure(StatusCode::ScheduleCanceled, reason)),
            QueueItem::Group(group) => group
                .promise
                .complete(ScheduleResult::failure(StatusCode::ScheduleCanceled, reason)),
            QueueItem::Aggregated(_) => {}
        }
        self.erase_record(item);
        self.unindex(item);
    }

    fn on_instance_schedule_done(&mut self, instance: Arc<InstanceItem>, result: ScheduleResult) {
        if instance.cancel.is_canceled() {
            warn!(
                "{}|instance schedule canceled (reason: {}) but schedule completed, rolling back",
                instance.request_id,
                instance.cancel.reason().unwrap_or_default()
            );
            self.performer.roll_back(&mut self.pre_ctx, &result);
            self.finish_canceled(&QueueItem::Instance(instance));
            return;
        }
        if self
            .policy
            .need_suspend(result.code, instance.timeout_ms())
        {
            warn!(
                "{}|instance schedule resource not enough (code: {}), push to pending queue",
                instance.request_id, result.code
            );
            self.recorder
                .record_schedule_err(&instance.request_id, result.status());
            instance.tag_failure();
            let item = QueueItem::Instance(instance);
            self.pending.enqueue(item.clone());
            self.policy.store_pending_info(&item);
            return;
        }
        info!(
            "{}|instance schedule complete, code: {}",
            instance.request_id, result.code
        );
        let item = QueueItem::Instance(instance.clone());
        self.erase_record(&item);
        self.unindex(&item);
        instance.promise.complete(result);
    }

    fn on_group_schedule_done(&mut self, group: Arc<GroupScheduleItem>, result: ScheduleResult) {
        if group.cancel.is_canceled() {
            warn!(
                "{}|group schedule canceled (reason: {}) but schedule completed, rolling back",
                group.request_id,
                group.cancel.reason().unwrap_or_default()
            );
            self.performer.roll_back(&mut self.pre_ctx, &result);
            self.finish_canceled(&QueueItem::Group(group));
            return;
        }
        if self.policy.need_suspend(result.code, group.timeout_ms()) {
            warn!(
                "{}|group schedule resource not enough (code: {}), push to pending queue",
                group.request_id, result.code
            );
            // A failed group leaves nothing reserved; the performer rolled
            // its partial placements back already.
            self.recorder
                .record_schedule_err(&group.request_id, result.status());
            group.tag_failure();
            let item = QueueItem::Group(group);
            self.pending.enqueue(item.clone());
            self.policy.store_pending_info(&item);
            return;
        }
        info!(
            "{}|group schedule complete, code: {}",
            group.request_id, result.code
        );
        let item = QueueItem::Group(group.clone());
        self.erase_record(&item);
        self.unindex(&item);
        group.promise.complete(result);
    }

    fn erase_record(&mut self, item: &QueueItem) {
        let failed = match item {
            QueueItem::Instance(i) => i.has_failed(),
            QueueItem::Group(g) => g.has_failed(),
            QueueItem::Aggregated(_) => false,
        };
        if failed {
            self.recorder.erase_schedule_err(&item.request_id());
        }
    }
}

fn cancel_reason(item: &QueueItem) -> String {
    match item {
        QueueItem::Instance(i) => i.cancel.reason().unwrap_or_default(),
        QueueItem::Group(g) => g.cancel.reason().unwrap_or_default(),
        QueueItem::Aggregated(_) => String::new(),
    }
}
