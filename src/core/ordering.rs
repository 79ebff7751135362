// src/core/ordering.rs

//! Per-instance invocation ordering: monotonic sequence assignment at
//! submission and completion tracking that slides the unfinished pointer
//! forward, so the instance runtime can enforce deterministic execution
//! order while completions arrive concurrently.

use crate::core::signal;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Default)]
struct InstanceOrdering {
    /// Assigned to the next invoke at submission time.
    next_seq: u64,
    /// The lowest sequence number not yet completed.
    unfinished_seq: u64,
    /// Completed sequence numbers ahead of `unfinished_seq`.
    finished_out_of_order: BTreeMap<u64, ()>,
}

/// Owns the ordering counters for every instance that requested ordered
/// invocations. Entries are dropped when the instance is killed or its
/// group cleared.
#[derive(Debug, Default)]
pub struct InvokeOrderManager {
    instances: Mutex<HashMap<String, InstanceOrdering>>,
}

impl InvokeOrderManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers an instance for ordering at create time and assigns the
    /// create request sequence 0. No-op when already registered.
    pub fn create_instance(&self, instance_id: &str) -> Option<u64> {
        if instance_id.is_empty() {
            return None;
        }
        let mut instances = self.instances.lock();
        if instances.contains_key(instance_id) {
            debug!("ordering: instance {} already registered", instance_id);
            return None;
        }
        debug!("ordering: register instance {}", instance_id);
        let ordering = instances.entry(instance_id.to_string()).or_default();
        let seq = ordering.next_seq;
        ordering.next_seq += 1;
        Some(seq)
    }

    /// Registers an instance without consuming a sequence number.
    pub fn register_instance(&self, instance_id: &str) {
        if instance_id.is_empty() {
            return;
        }
        let mut instances = self.instances.lock();
        instances.entry(instance_id.to_string()).or_default();
    }

    /// Assigns the next sequence number for an invoke on the instance.
    /// `register_if_missing` covers the get-named-instance path where the
    /// first contact with the instance is an invoke.
    pub fn assign_seq(&self, instance_id: &str, register_if_missing: bool) -> Option<u64> {
        if instance_id.is_empty() {
            return None;
        }
        let mut instances = self.instances.lock();
        if !instances.contains_key(instance_id) && !register_if_missing {
            return None;
        }
        let ordering = instances.entry(instance_id.to_string()).or_default();
        let seq = ordering.next_seq;
        ordering.next_seq += 1;
        debug!(
            "ordering: instance {} assigned seq {} (unfinished {})",
            instance_id, seq, ordering.unfinished_seq
        );
        Some(seq)
    }

    /// The current unfinished sequence number, carried on the request wire.
    pub fn unfinished_seq(&self, instance_id: &str) -> Option<u64> {
        let instances = self.instances.lock();
        instances.get(instance_id).map(|o| o.unfinished_seq)
    }

    /// Records a completed invoke. Out-of-order completions are buffered;
    /// the unfinished pointer advances while the buffer front is contiguous.
    pub fn notify_invoke_success(&self, instance_id: &str, seq: u64) {
        let mut instances = self.instances.lock();
        let Some(ordering) = instances.get_mut(instance_id) else {
            return;
        };
        ordering.finished_out_of_order.insert(seq, ());
        while let Some((&front, _)) = ordering.finished_out_of_order.first_key_value() {
            if front != ordering.unfinished_seq {
                break;
            }
            ordering.unfinished_seq += 1;
            ordering.finished_out_of_order.remove(&front);
        }
        debug!(
            "ordering: instance {} unfinished now {}, {} buffered",
            instance_id,
            ordering.unfinished_seq,
            ordering.finished_out_of_order.len()
        );
    }

    /// Drops ordering state for a killed instance, or everything on a
    /// kill-all signal.
    pub fn clear_on_signal(&self, instance_id: &str, sig: i32) {
        let mut instances = self.instances.lock();
        if sig == signal::KILL_ALL_INSTANCES {
            debug!("ordering: kill-all received, dropping all ordering state");
            instances.clear();
            return;
        }
        if matches!(
            sig,
            signal::KILL_INSTANCE | signal::KILL_GROUP_INSTANCE | signal::KILL_INSTANCE_SYNC
        ) && !instance_id.is_empty()
        {
            instances.remove(instance_id);
        }
    }

    pub fn remove_instance(&self, instance_id: &str) {
        self.instances.lock().remove(instance_id);
    }

    pub fn tracked_instances(&self) -> usize {
        self.instances.lock().len()
    }
}
