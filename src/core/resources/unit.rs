// src/core/resources/unit.rs

//! A resource unit: the smallest schedulable fragment of the cluster
//! resource view, owned by exactly one node.

use super::demand::Resources;
use super::labels::LabelSet;
use crate::core::instances::InstanceInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A leaf fragment of the resource hierarchy. Invariants, re-established by
/// every mutation:
///   allocatable = capacity − Σ resources of placed instances
///   node_labels = base_labels ⊎ labels of placed instances (multiset union)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUnit {
    #[serde(rename = "unitid")]
    pub unit_id: String,
    #[serde(rename = "ownerid")]
    pub owner_id: String,
    pub capacity: Resources,
    pub allocatable: Resources,
    #[serde(rename = "baselabels", default)]
    pub base_labels: LabelSet,
    #[serde(rename = "nodelabels", default)]
    pub node_labels: LabelSet,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceInfo>,
    /// The resource group this unit is carved into, if any.
    #[serde(rename = "resourcegroup", default)]
    pub resource_group: Option<String>,
}

impl ResourceUnit {
    pub fn new(unit_id: impl Into<String>, owner_id: impl Into<String>, capacity: Resources) -> Self {
        ResourceUnit {
            unit_id: unit_id.into(),
            owner_id: owner_id.into(),
            allocatable: capacity.clone(),
            capacity,
            base_labels: LabelSet::new(),
            node_labels: LabelSet::new(),
            instances: BTreeMap::new(),
            resource_group: None,
        }
    }

    pub fn with_base_labels(mut self, labels: LabelSet) -> Self {
        self.base_labels = labels.clone();
        self.node_labels = labels;
        self
    }

    /// Places an instance, shrinking the allocatable pool and merging the
    /// instance's label contribution.
    pub fn place(&mut self, info: InstanceInfo) {
        self.allocatable = self.allocatable.clone() - &info.resources;
        self.node_labels.merge(&LabelSet::from_labels(&info.labels));
        self.instances.insert(info.instance_id.clone(), info);
    }

    /// Removes a placed instance, restoring allocatable and labels.
    pub fn evict(&mut self, instance_id: &str) -> Option<InstanceInfo> {
        let info = self.instances.remove(instance_id)?;
        self.allocatable = self.allocatable.clone() + &info.resources;
        self.node_labels
            .subtract(&LabelSet::from_labels(&info.labels));
        Some(info)
    }

    /// Grows (or shrinks, with a saturating floor) the unit's capacity.
    pub fn apply_capacity_delta(&mut self, grow: &Resources, shrink: &Resources) {
        self.capacity = self.capacity.clone() + grow - shrink;
        self.allocatable = self.allocatable.clone() + grow - shrink;
    }

    /// Re-derives the invariant from scratch; used by debug assertions and
    /// the property tests.
    pub fn recompute(&self) -> (Resources, LabelSet) {
        let mut allocatable = self.capacity.clone();
        let mut labels = self.base_labels.clone();
        for info in self.instances.values() {
            allocatable = allocatable - &info.resources;
            labels.merge(&LabelSet::from_labels(&info.labels));
        }
        (allocatable, labels)
    }
}
