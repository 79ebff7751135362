// src/core/resources/view.rs

//! The authoritative cluster resource view. Writers serialize on a per-unit
//! lock; the scheduler consumes immutable point-in-time snapshots.

use super::demand::Resources;
use super::labels::LabelSet;
use super::unit::ResourceUnit;
use crate::core::errors::StratusError;
use crate::core::instances::InstanceInfo;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An immutable snapshot of the resource view handed to one scheduling
/// pass. `all_local_labels` is the union over every unit's labels, used by
/// the affinity search to short-circuit selectors no unit can satisfy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceViewInfo {
    pub units: Vec<ResourceUnit>,
    pub all_local_labels: LabelSet,
}

impl ResourceViewInfo {
    pub fn unit(&self, unit_id: &str) -> Option<&ResourceUnit> {
        self.units.iter().find(|u| u.unit_id == unit_id)
    }
}

/// The mutable resource view. Each unit lives behind its own DashMap shard
/// entry, so concurrent mutations of different units do not contend.
#[derive(Default)]
pub struct ResourceView {
    units: DashMap<String, ResourceUnit>,
}

impl ResourceView {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_unit(&self, unit: ResourceUnit) {
        debug!(
            "resource view: add unit({}) owner({}) capacity({})",
            unit.unit_id, unit.owner_id, unit.capacity
        );
        self.units.insert(unit.unit_id.clone(), unit);
    }

    pub fn remove_unit(&self, unit_id: &str) -> Option<ResourceUnit> {
        debug!("resource view: remove unit({})", unit_id);
        self.units.remove(unit_id).map(|(_, u)| u)
    }

    /// Adjusts a unit's capacity by a grow/shrink delta.
    pub fn update_unit(
        &self,
        unit_id: &str,
        grow: &Resources,
        shrink: &Resources,
    ) -> Result<(), StratusError> {
        let mut entry = self
            .units
            .get_mut(unit_id)
            .ok_or_else(|| StratusError::Internal(format!("unknown resource unit {unit_id}")))?;
        entry.apply_capacity_delta(grow, shrink);
        Ok(())
    }

    /// Atomically places a batch of instances on one unit.
    pub fn add_instances(
        &self,
        unit_id: &str,
        instances: Vec<InstanceInfo>,
    ) -> Result<(), StratusError> {
        let mut entry = self
            .units
            .get_mut(unit_id)
            .ok_or_else(|| StratusError::Internal(format!("unknown resource unit {unit_id}")))?;
        for info in instances {
            debug!(
                "resource view: place instance({}) on unit({})",
                info.instance_id, unit_id
            );
            entry.place(info);
        }
        Ok(())
    }

    /// Atomically removes a batch of instances from one unit.
    pub fn remove_instances(
        &self,
        unit_id: &str,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceInfo>, StratusError> {
        let mut entry = self
            .units
            .get_mut(unit_id)
            .ok_or_else(|| StratusError::Internal(format!("unknown resource unit {unit_id}")))?;
        let mut removed = Vec::new();
        for id in instance_ids {
            if let Some(info) = entry.evict(id) {
                removed.push(info);
            }
        }
        Ok(removed)
    }

    /// Tags or untags a unit's resource-group membership in place.
    pub fn set_unit_resource_group(&self, unit_id: &str, group: Option<String>) -> bool {
        match self.units.get_mut(unit_id) {
            Some(mut unit) => {
                unit.resource_group = group;
                true
            }
            None => false,
        }
    }

    /// Locates the unit an instance is currently placed on.
    pub fn find_instance_unit(&self, instance_id: &str) -> Option<String> {
        self.units
            .iter()
            .find(|e| e.instances.contains_key(instance_id))
            .map(|e| e.unit_id.clone())
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Builds an immutable snapshot for one scheduling pass.
    pub fn snapshot(&self) -> ResourceViewInfo {
        let mut units: Vec<ResourceUnit> = self.units.iter().map(|e| e.value().clone()).collect();
        units.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        let mut all_local_labels = LabelSet::new();
        for unit in &units {
            all_local_labels.merge(&unit.node_labels);
        }
        ResourceViewInfo {
            units,
            all_local_labels,
        }
    }
}
