// src/core/rgroup.rs

//! Resource groups: named slices of the resource view. Units carved into a
//! group only accept instances whose schedule options name that group.

use crate::core::errors::{Status, StatusCode};
use crate::core::resources::view::ResourceView;
use dashmap::DashMap;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ResourceGroupRecord {
    pub name: String,
    pub unit_ids: Vec<String>,
}

/// Tracks which units belong to which resource group. The unit's own
/// `resource_group` field is the placement-time source of truth; this
/// registry answers queries and removal.
#[derive(Debug, Default)]
pub struct ResourceGroupRegistry {
    groups: DashMap<String, ResourceGroupRecord>,
}

impl ResourceGroupRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a resource group over the named units, tagging each unit.
    pub fn create(&self, view: &ResourceView, name: &str, unit_ids: Vec<String>) -> Status {
        if self.groups.contains_key(name) {
            return Status::new(
                StatusCode::ParameterError,
                format!("resource group {name} already exists"),
            );
        }
        let snapshot = view.snapshot();
        for unit_id in &unit_ids {
            let Some(unit) = snapshot.unit(unit_id) else {
                return Status::new(
                    StatusCode::ParameterError,
                    format!("resource group {name} references unknown unit {unit_id}"),
                );
            };
            if let Some(existing) = &unit.resource_group {
                return Status::new(
                    StatusCode::ParameterError,
                    format!("unit {unit_id} already belongs to resource group {existing}"),
                );
            }
        }
        for unit_id in &unit_ids {
            view.set_unit_resource_group(unit_id, Some(name.to_string()));
        }
        info!("resource group {} created over {:?}", name, unit_ids);
        self.groups.insert(
            name.to_string(),
            ResourceGroupRecord {
                name: name.to_string(),
                unit_ids,
            },
        );
        Status::ok()
    }

    /// Removes a resource group, untagging its units.
    pub fn remove(&self, view: &ResourceView, name: &str) -> Status {
        let Some((_, record)) = self.groups.remove(name) else {
            return Status::new(
                StatusCode::ParameterError,
                format!("resource group {name} does not exist"),
            );
        };
        for unit_id in &record.unit_ids {
            view.set_unit_resource_group(unit_id, None);
        }
        info!("resource group {} removed", name);
        Status::ok()
    }

    pub fn get(&self, name: &str) -> Option<ResourceGroupRecord> {
        self.groups.get(name).map(|e| e.value().clone())
    }
}
