// src/core/scheduler/policy.rs

//! Priority policies gating admission from the running queue. The fairness
//! policy holds back candidates whose demand looks like an already-pending
//! request, so a starving large request is not overtaken forever by a
//! stream of identical small ones.

use super::item::{GroupScheduleItem, InstanceItem, QueueItem};
use crate::core::errors::StatusCode;
use crate::core::resources::SelectorSet;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Marker key for pending items with no resource required affinity: such an
/// item may consume anything, so every candidate conflicts with it.
const EMPTY_PENDING_AFFINITY_KEY: &str = "empty";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityPolicyKind {
    Fifo,
    Fairness,
}

/// The admission policy consulted by the scheduler loop.
pub trait PriorityPolicy: Send {
    fn kind(&self) -> PriorityPolicyKind;

    /// Whether the item may attempt scheduling now, or must wait behind
    /// priority-matching pending items with conflicting affinity.
    fn can_schedule(&self, item: &QueueItem) -> bool;

    /// Attaches whatever pending bookkeeping the performer should respect.
    fn prepare_for_scheduling(&self, item: &QueueItem);

    /// Records a freshly parked item in the pending bookkeeping.
    fn store_pending_info(&mut self, item: &QueueItem);

    /// Wipes the pending bookkeeping when the pending queue activates.
    fn clear_pending_infos(&mut self);

    /// Whether a failure with `code` parks the item instead of failing it.
    fn need_suspend(&self, code: StatusCode, timeout_ms: u64) -> bool {
        code.need_suspend(timeout_ms)
    }
}

/// FIFO: no fairness gating; everything schedules in queue order.
#[derive(Default)]
pub struct FifoPolicy;

impl PriorityPolicy for FifoPolicy {
    fn kind(&self) -> PriorityPolicyKind {
        PriorityPolicyKind::Fifo
    }

    fn can_schedule(&self, _item: &QueueItem) -> bool {
        true
    }

    fn prepare_for_scheduling(&self, _item: &QueueItem) {}

    fn store_pending_info(&mut self, _item: &QueueItem) {}

    fn clear_pending_infos(&mut self) {}
}

/// The fairness policy. Per priority level it maintains the serialized
/// resource-affinity keys of pending items with their counts, plus the
/// union of their selector sets for attachment to candidates.
#[derive(Default)]
pub struct FairnessPolicy {
    /// priority → (serialized resource required affinity → pending count).
    pending_affinity_counts: BTreeMap<u16, HashMap<String, u32>>,
    /// priority → distinct pending selector sets at that priority.
    pending_affinities: BTreeMap<u16, Vec<SelectorSet>>,
}

impl FairnessPolicy {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether any pending item at `priority` or above has no resource
    /// required affinity at all.
    fn has_non_affinity_pending(&self, priority: u16) -> bool {
        self.pending_affinity_counts
            .range(priority..)
            .any(|(_, counts)| {
                counts
                    .get(EMPTY_PENDING_AFFINITY_KEY)
                    .is_some_and(|c| *c > 0)
            })
    }

    fn affinity_key(instance: &InstanceItem) -> String {
        instance
            .instance
            .schedule_options
            .affinity
            .resource_required_key()
            .unwrap_or_else(|| EMPTY_PENDING_AFFINITY_KEY.to_string())
    }

    fn store_instance(&mut self, instance: &Arc<InstanceItem>) {
        let priority = instance.priority();
        let key = Self::affinity_key(instance);
        if key != EMPTY_PENDING_AFFINITY_KEY {
            let counts = self.pending_affinity_counts.entry(priority).or_default();
            if !counts.contains_key(&key) {
                if let Some(set) = instance
                    .instance
                    .schedule_options
                    .affinity
                    .resource
                    .as_ref()
                {
                    self.pending_affinities
                        .entry(priority)
                        .or_default()
                        .push(set.required_only());
                }
            }
        }
        *self
            .pending_affinity_counts
            .entry(priority)
            .or_default()
            .entry(key)
            .or_insert(0) += 1;
    }

    /// Whether the instance's demand collides with a pending item at its
    /// priority or above.
    fn has_similar_demand(&self, instance: &InstanceItem) -> bool {
        let priority = instance.priority();
        if self.has_non_affinity_pending(priority) {
            debug!(
                "{}|pending item with no resource affinity exists, candidate conflicts",
                instance.request_id
            );
            return true;
        }
        let key = Self::affinity_key(instance);
        self.pending_affinity_counts
            .range(priority..)
            .any(|(_, counts)| counts.get(&key).is_some_and(|c| *c > 0))
    }

    fn attach_pending(&self, instance: &Arc<InstanceItem>) {
        let priority = instance.priority();
        let mut attached = Vec::new();
        for (_, sets) in self.pending_affinities.range(priority..) {
            attached.extend(sets.iter().cloned());
        }
        *instance.pending_affinity.lock() = attached;
    }

    fn group_members<'a>(
        group: &'a GroupScheduleItem,
    ) -> impl Iterator<Item = &'a Arc<InstanceItem>> {
        // Range groups share one body request; one member represents all.
        let take = if group.options.is_range {
            1
        } else {
            group.members.len()
        };
        group.members.iter().take(take)
    }
}

impl PriorityPolicy for FairnessPolicy {
    fn kind(&self) -> PriorityPolicyKind {
        PriorityPolicyKind::Fairness
    }

    fn can_schedule(&self, item: &QueueItem) -> bool {
        match item {
            QueueItem::Instance(instance) => !self.has_similar_demand(instance),
            QueueItem::Group(group) => {
                if group.members.is_empty() {
                    warn!("{}|group schedule requests are empty", group.request_id);
                    return true;
                }
                !Self::group_members(group).any(|m| self.has_similar_demand(m))
            }
            QueueItem::Aggregated(aggregated) => {
                let requests = aggregated.requests.lock();
                match requests.front() {
                    Some(head) => !self.has_similar_demand(head),
                    None => true,
                }
            }
        }
    }

    fn prepare_for_scheduling(&self, item: &QueueItem) {
        match item {
            QueueItem::Instance(instance) => self.attach_pending(instance),
            QueueItem::Group(group) => {
                for member in &group.members {
                    self.attach_pending(member);
                }
            }
            QueueItem::Aggregated(aggregated) => {
                if let Some(head) = aggregated.requests.lock().front() {
                    self.attach_pending(head);
                }
            }
        }
    }

    fn store_pending_info(&mut self, item: &QueueItem) {
        match item {
            QueueItem::Instance(instance) => self.store_instance(instance),
            QueueItem::Group(group) => {
                if group.members.is_empty() {
                    warn!("{}|group schedule requests are empty", group.request_id);
                    return;
                }
                let members: Vec<_> = Self::group_members(group).cloned().collect();
                for member in members {
                    self.store_instance(&member);
                }
            }
            QueueItem::Aggregated(aggregated) => {
                let head = aggregated.requests.lock().front().cloned();
                if let Some(head) = head {
                    self.store_instance(&head);
                }
            }
        }
    }

    fn clear_pending_infos(&mut self) {
        self.pending_affinity_counts.clear();
        self.pending_affinities.clear();
    }
}
