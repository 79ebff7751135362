// src/core/instances.rs

//! Instance data model and the registry tracking every instance the control
//! plane knows about, including named-instance lookup and the heartbeat
//! monitor that degrades silent instances to sub-health and then FATAL.

use crate::core::errors::{StratusError, Status, StatusCode};
use crate::core::meta::{MetaStore, INSTANCE_PATH_PREFIX};
use crate::core::resources::{Affinity, Resources};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle states of a function instance. Transitions are monotonic in
/// declaration order, except that `Creating`/`Running` may drop to `Fatal`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
pub enum InstanceState {
    Scheduling,
    Creating,
    Running,
    Exiting,
    Exited,
    Evicting,
    Fatal,
}

impl Default for InstanceState {
    fn default() -> Self {
        InstanceState::Scheduling
    }
}

impl InstanceState {
    /// Whether an instance in this state is still alive from the group
    /// manager's point of view (i.e. worth signalling).
    pub fn is_alive(&self) -> bool {
        !matches!(self, InstanceState::Fatal)
    }

    /// Validates a state transition.
    pub fn can_transition(self, next: InstanceState) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            // Failure is reachable from the active states only.
            (InstanceState::Creating | InstanceState::Running, InstanceState::Fatal) => true,
            (_, InstanceState::Fatal) => false,
            // Otherwise strictly forward.
            (from, to) => to > from,
        }
    }
}

/// Per-request scheduling knobs carried by an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    #[serde(default)]
    pub priority: u16,
    #[serde(default)]
    pub preempted_allowed: bool,
    #[serde(default)]
    pub affinity: Affinity,
    /// How long a schedule request may stay parked in the pending queue.
    /// Zero means fail immediately on resource shortage.
    #[serde(default)]
    pub schedule_timeout_ms: u64,
    /// Restricts placement to units of the named resource group.
    #[serde(default)]
    pub resource_group: Option<String>,
}

/// Everything the control plane persists about one function instance.
/// Stored as JSON at `/sn/instance/{instanceId}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    #[serde(rename = "instanceid")]
    pub instance_id: String,
    #[serde(rename = "requestid")]
    pub request_id: String,
    #[serde(rename = "traceid", default)]
    pub trace_id: String,
    #[serde(rename = "function")]
    pub function_urn: String,
    /// The node that materialized this instance; empty while scheduling.
    #[serde(rename = "ownernode", default)]
    pub owner_node: String,
    pub resources: Resources,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(rename = "scheduleopts", default)]
    pub schedule_options: ScheduleOptions,
    #[serde(default = "default_state")]
    pub state: InstanceState,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(rename = "groupid", default)]
    pub group_id: Option<String>,
    #[serde(rename = "parentid", default)]
    pub parent_instance_id: Option<String>,
    #[serde(rename = "name", default)]
    pub named_instance: Option<String>,
    /// Set by the heartbeat monitor; sub-healthy instances stay schedulable
    /// but are preferred as preemption victims.
    #[serde(default)]
    pub sub_health: bool,
}

fn default_state() -> InstanceState {
    InstanceState::Scheduling
}

impl InstanceInfo {
    pub fn priority(&self) -> u16 {
        self.schedule_options.priority
    }

    pub fn meta_key(&self) -> String {
        instance_key(&self.instance_id)
    }
}

pub fn instance_key(instance_id: &str) -> String {
    format!("{INSTANCE_PATH_PREFIX}{instance_id}")
}

/// Heartbeat bookkeeping for one instance.
#[derive(Debug, Clone)]
struct HeartbeatRecord {
    last_beat: Instant,
}

/// The in-memory registry of instances, kept consistent with the metadata
/// store by the server's dispatch layer. Shared across the scheduler, the
/// group manager, and the query surface.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<String, InstanceInfo>,
    named: DashMap<String, String>,
    heartbeats: DashMap<String, HeartbeatRecord>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Inserts or replaces an instance record, maintaining the name index.
    pub fn upsert(&self, info: InstanceInfo) {
        if let Some(name) = &info.named_instance {
            self.named.insert(name.clone(), info.instance_id.clone());
        }
        self.instances.insert(info.instance_id.clone(), info);
    }

    pub fn get(&self, instance_id: &str) -> Option<InstanceInfo> {
        self.instances.get(instance_id).map(|e| e.value().clone())
    }

    pub fn resolve_named(&self, name: &str) -> Option<InstanceInfo> {
        let id = self.named.get(name)?.value().clone();
        self.get(&id)
    }

    pub fn list_named(&self) -> Vec<InstanceInfo> {
        self.named
            .iter()
            .filter_map(|e| self.get(e.value()))
            .collect()
    }

    pub fn list(&self) -> Vec<InstanceInfo> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Applies a state transition, rejecting moves the lifecycle forbids.
    pub fn transition(
        &self,
        instance_id: &str,
        next: InstanceState,
    ) -> Result<InstanceInfo, StratusError> {
        let mut entry = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| StratusError::InstanceNotFound(instance_id.to_string()))?;
        if !entry.state.can_transition(next) {
            return Err(StratusError::Parameter(format!(
                "illegal instance state transition {} -> {next} for {instance_id}",
                entry.state
            )));
        }
        entry.state = next;
        Ok(entry.value().clone())
    }

    /// Removes an instance and its auxiliary index entries.
    pub fn remove(&self, instance_id: &str) -> Option<InstanceInfo> {
        let (_, info) = self.instances.remove(instance_id)?;
        if let Some(name) = &info.named_instance {
            self.named.remove(name);
        }
        self.heartbeats.remove(instance_id);
        Some(info)
    }

    /// Records a heartbeat from the instance's runtime.
    pub fn record_heartbeat(&self, instance_id: &str) {
        self.heartbeats.insert(
            instance_id.to_string(),
            HeartbeatRecord {
                last_beat: Instant::now(),
            },
        );
        if let Some(mut entry) = self.instances.get_mut(instance_id) {
            if entry.sub_health {
                info!("instance({}) recovered from sub-health", instance_id);
                entry.sub_health = false;
            }
        }
    }

    /// One heartbeat sweep. Returns the instances newly degraded to FATAL so
    /// the caller can feed the group cascade.
    pub fn sweep_heartbeats(
        &self,
        sub_health_after: Duration,
        fatal_after: Duration,
    ) -> Vec<InstanceInfo> {
        let now = Instant::now();
        let mut fatal = Vec::new();
        for beat in self.heartbeats.iter() {
            let silent = now.saturating_duration_since(beat.value().last_beat);
            let Some(mut entry) = self.instances.get_mut(beat.key()) else {
                continue;
            };
            if entry.state != InstanceState::Running {
                continue;
            }
            if silent >= fatal_after {
                warn!(
                    "instance({}) heartbeat lost for {:?}, marking FATAL",
                    beat.key(),
                    silent
                );
                entry.state = InstanceState::Fatal;
                entry.exit_code = StatusCode::HeartbeatLost as i32;
                fatal.push(entry.value().clone());
            } else if silent >= sub_health_after && !entry.sub_health {
                debug!(
                    "instance({}) heartbeat late for {:?}, marking sub-health",
                    beat.key(),
                    silent
                );
                entry.sub_health = true;
            }
        }
        fatal
    }

    /// Persists the current record of `instance_id` to the metadata store.
    pub async fn persist(
        &self,
        meta: &Arc<dyn MetaStore>,
        instance_id: &str,
    ) -> Result<(), StratusError> {
        let info = self
            .get(instance_id)
            .ok_or_else(|| StratusError::InstanceNotFound(instance_id.to_string()))?;
        let value = serde_json::to_string(&info)?;
        meta.put(&info.meta_key(), &value, None).await?;
        Ok(())
    }
}

/// A kill order routed to an instance's owner node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardKillRequest {
    #[serde(rename = "requestid")]
    pub request_id: String,
    #[serde(rename = "srcinstanceid")]
    pub src_instance_id: String,
    #[serde(rename = "instancerequestid")]
    pub instance_request_id: String,
    #[serde(rename = "instanceid")]
    pub instance_id: String,
    pub signal: i32,
    pub payload: String,
}

impl ForwardKillRequest {
    pub fn new(info: &InstanceInfo, src_instance_id: &str, signal: i32, msg: &str) -> Self {
        ForwardKillRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            src_instance_id: src_instance_id.to_string(),
            instance_request_id: info.request_id.clone(),
            instance_id: info.instance_id.clone(),
            signal,
            payload: msg.to_string(),
        }
    }
}

/// Acknowledgement of a forwarded kill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardKillResponse {
    #[serde(rename = "requestid")]
    pub request_id: String,
    pub status: Status,
}
