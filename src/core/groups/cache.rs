// src/core/groups/cache.rs

//! The group manager's read caches: three indices over the watched group
//! keys plus the per-group instance maps. Owned exclusively by the group
//! manager actor; no locking needed.

use super::manager::GroupInfo;
use crate::core::instances::InstanceInfo;
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::debug;

/// (meta-store key, group info) as cached for one group id.
pub type GroupKeyInfo = (String, GroupInfo);

#[derive(Debug, Default)]
pub struct GroupCaches {
    /// group id → (key, group).
    groups: HashMap<String, GroupKeyInfo>,
    /// owner node → key → group.
    node_groups: HashMap<String, IndexMap<String, GroupInfo>>,
    /// parent instance id → key → group.
    parent_groups: HashMap<String, IndexMap<String, GroupInfo>>,
    /// group id → instance key → instance.
    group_instances: HashMap<String, IndexMap<String, InstanceInfo>>,
}

impl GroupCaches {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_group(&mut self, key: &str, group: GroupInfo) {
        debug!(
            "group cache: add group(id={}, parent={:?}, node={}, status={})",
            group.group_id, group.parent_id, group.owner_node, group.status
        );
        self.node_groups
            .entry(group.owner_node.clone())
            .or_default()
            .insert(key.to_string(), group.clone());
        if let Some(parent) = &group.parent_id {
            self.parent_groups
                .entry(parent.clone())
                .or_default()
                .insert(key.to_string(), group.clone());
        }
        self.groups
            .insert(group.group_id.clone(), (key.to_string(), group));
    }

    pub fn remove_group(&mut self, group_id: &str) {
        debug!("group cache: remove group({})", group_id);
        let Some((key, group)) = self.groups.remove(group_id) else {
            return;
        };
        if let Some(groups) = self.node_groups.get_mut(&group.owner_node) {
            groups.shift_remove(&key);
            if groups.is_empty() {
                self.node_groups.remove(&group.owner_node);
            }
        }
        if let Some(parent) = &group.parent_id {
            if let Some(groups) = self.parent_groups.get_mut(parent) {
                groups.shift_remove(&key);
                if groups.is_empty() {
                    self.parent_groups.remove(parent);
                }
            }
        }
        self.group_instances.remove(group_id);
    }

    pub fn group_info(&self, group_id: &str) -> Option<&GroupKeyInfo> {
        self.groups.get(group_id)
    }

    pub fn group_info_mut(&mut self, group_id: &str) -> Option<&mut GroupKeyInfo> {
        self.groups.get_mut(group_id)
    }

    pub fn node_groups(&self, node: &str) -> Vec<(String, GroupInfo)> {
        self.node_groups
            .get(node)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn child_groups(&self, parent_instance_id: &str) -> Vec<(String, GroupInfo)> {
        self.parent_groups
            .get(parent_instance_id)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn add_group_instance(&mut self, group_id: &str, instance_key: &str, info: InstanceInfo) {
        self.group_instances
            .entry(group_id.to_string())
            .or_default()
            .insert(instance_key.to_string(), info);
    }

    pub fn remove_group_instance(&mut self, group_id: &str, instance_key: &str) {
        if let Some(instances) = self.group_instances.get_mut(group_id) {
            instances.shift_remove(instance_key);
            if instances.is_empty() {
                self.group_instances.remove(group_id);
            }
        }
    }

    pub fn group_instances(&self, group_id: &str) -> Vec<(String, InstanceInfo)> {
        self.group_instances
            .get(group_id)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn group_instance_count(&self, group_id: &str) -> usize {
        self.group_instances
            .get(group_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn groups(&self) -> Vec<GroupKeyInfo> {
        self.groups.values().cloned().collect()
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }
}
