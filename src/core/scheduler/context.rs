// src/core/scheduler/context.rs

//! The pre-allocated context: a per-scheduling-pass tally of tentative
//! reservations, so that multiple items placed in one pass see a consistent
//! "what would remain" view before the resource view commits anything.

use crate::core::resources::{LabelSet, Resources};
use std::collections::HashMap;

/// Single-producer single-consumer within one scheduling pass; discarded
/// afterwards.
#[derive(Debug, Default, Clone)]
pub struct PreAllocatedContext {
    /// unit id → resources tentatively reserved on it this pass.
    pub allocated: HashMap<String, Resources>,
    /// unit id → label contributions tentatively added this pass.
    pub allocated_labels: HashMap<String, LabelSet>,
    /// Superset of every label present anywhere in the snapshot, used to
    /// short-circuit selectors no unit can satisfy.
    pub all_local_labels: LabelSet,
}

impl PreAllocatedContext {
    pub fn new(all_local_labels: LabelSet) -> Self {
        PreAllocatedContext {
            allocated: HashMap::new(),
            allocated_labels: HashMap::new(),
            all_local_labels,
        }
    }

    /// Records a tentative reservation on a unit.
    pub fn reserve(&mut self, unit_id: &str, resources: &Resources, labels: &LabelSet) {
        let entry = self
            .allocated
            .entry(unit_id.to_string())
            .or_default();
        *entry = entry.clone() + resources;
        self.allocated_labels
            .entry(unit_id.to_string())
            .or_default()
            .merge(labels);
    }

    /// Releases a previously recorded reservation (rollback path).
    pub fn release(&mut self, unit_id: &str, resources: &Resources, labels: &LabelSet) {
        if let Some(entry) = self.allocated.get_mut(unit_id) {
            *entry = entry.saturating_sub(resources);
        }
        if let Some(entry) = self.allocated_labels.get_mut(unit_id) {
            entry.subtract(labels);
        }
    }

    /// What `avail` shrinks to after this pass's reservations on `unit_id`.
    pub fn remaining_of(&self, unit_id: &str, avail: &Resources) -> Resources {
        match self.allocated.get(unit_id) {
            Some(reserved) => avail.saturating_sub(reserved),
            None => avail.clone(),
        }
    }

    /// A unit's labels including this pass's tentative contributions.
    pub fn labels_of(&self, unit_id: &str, base: &LabelSet) -> LabelSet {
        match self.allocated_labels.get(unit_id) {
            Some(added) => base.union(added),
            None => base.clone(),
        }
    }
}
