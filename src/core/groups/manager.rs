// src/core/groups/manager.rs

//! The group manager actor. A replicated singleton selected by leader
//! election: only the master mutates group state; slaves maintain read
//! caches from the same watch stream. All handlers run on the actor's
//! mailbox task, which serializes per-group mutations.

use super::cache::GroupCaches;
use crate::core::errors::{Status, StatusCode, StratusError};
use crate::core::instances::{ForwardKillRequest, InstanceInfo, InstanceRegistry, InstanceState};
use crate::core::meta::{
    GetOptions, MetaStore, WatchOptions, GROUP_PATH_PREFIX, INSTANCE_PATH_PREFIX,
};
use crate::core::router::NodeRouter;
use crate::core::scheduler::item::GroupOptions;
use crate::core::signal::{GROUP_EXIT_SIGNAL, SHUT_DOWN_SIGNAL};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Owner recorded on groups the manager itself has taken over.
pub const GROUP_MANAGER_OWNER: &str = "group-manager";

const MAILBOX_CAPACITY: usize = 1024;

/// How often a compare-and-swap group mutation is retried on a stale read.
const GROUP_CAS_RETRIES: usize = 3;

/// Group lifecycle states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display, Default,
)]
pub enum GroupState {
    #[default]
    Scheduling,
    Running,
    Failed,
}

/// Persisted group record, JSON at `/sn/group/{groupId}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    #[serde(rename = "groupId")]
    pub group_id: String,
    #[serde(rename = "ownerproxy", default)]
    pub owner_node: String,
    #[serde(rename = "parentid", default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub status: GroupState,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "traceid", default)]
    pub trace_id: String,
    #[serde(rename = "requestid", default)]
    pub request_id: String,
    #[serde(rename = "groupopts", default)]
    pub group_options: GroupOptions,
}

pub fn group_key(group_id: &str) -> String {
    format!("{GROUP_PATH_PREFIX}{group_id}")
}

/// The group manager's hook into the scheduler for cancelling members that
/// are still scheduling when their group is killed.
pub trait ScheduleControl: Send + Sync {
    fn try_cancel(&self, id: &str, reason: &str);
}

/// No-op control for contexts without a live scheduler.
pub struct NoopScheduleControl;

impl ScheduleControl for NoopScheduleControl {
    fn try_cancel(&self, _id: &str, _reason: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// The actor's mailbox protocol.
pub enum GroupCommand {
    GroupPut {
        key: String,
        group: GroupInfo,
    },
    GroupDelete {
        group: GroupInfo,
    },
    InstancePut {
        key: String,
        info: InstanceInfo,
    },
    InstanceDelete {
        key: String,
        info: InstanceInfo,
    },
    InstanceFatal {
        info: InstanceInfo,
    },
    KillGroup {
        group_id: String,
        src_instance_id: String,
        reply: oneshot::Sender<Status>,
    },
    NodeAbnormal {
        node: String,
    },
    RoleChange {
        role: Role,
    },
    /// Re-reads the group prefix and drops cache entries the store lost.
    Resync,
    /// Test/observability hook: a snapshot of the cached group ids.
    Inspect {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable handle to the actor's mailbox.
#[derive(Clone)]
pub struct GroupManagerHandle {
    tx: mpsc::Sender<GroupCommand>,
}

impl GroupManagerHandle {
    pub async fn send(&self, cmd: GroupCommand) -> Result<(), StratusError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| StratusError::ChannelClosed("group manager mailbox".into()))
    }

    pub async fn kill_group(&self, group_id: &str, src_instance_id: &str) -> Status {
        let (reply, rx) = oneshot::channel();
        if self
            .send(GroupCommand::KillGroup {
                group_id: group_id.to_string(),
                src_instance_id: src_instance_id.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return Status::new(StatusCode::InnerCommunication, "group manager unavailable");
        }
        rx.await.unwrap_or_else(|_| {
            Status::new(StatusCode::InnerCommunication, "kill group reply dropped")
        })
    }

    pub async fn instance_fatal(&self, info: InstanceInfo) {
        let _ = self.send(GroupCommand::InstanceFatal { info }).await;
    }

    pub async fn node_abnormal(&self, node: &str) {
        let _ = self
            .send(GroupCommand::NodeAbnormal {
                node: node.to_string(),
            })
            .await;
    }

    pub async fn role_change(&self, role: Role) {
        let _ = self.send(GroupCommand::RoleChange { role }).await;
    }

    pub async fn cached_group_ids(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.send(GroupCommand::Inspect { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

pub struct GroupManagerActor {
    role: Role,
    caches: GroupCaches,
    meta: Arc<dyn MetaStore>,
    router: Arc<dyn NodeRouter>,
    scheduler: Arc<dyn ScheduleControl>,
    registry: Arc<InstanceRegistry>,
    killing_groups: HashSet<String>,
    kill_timeout: Duration,
    mailbox: mpsc::Receiver<GroupCommand>,
}

impl GroupManagerActor {
    /// Spawns the actor plus its watch forwarders; returns the handle.
    pub async fn spawn(
        meta: Arc<dyn MetaStore>,
        router: Arc<dyn NodeRouter>,
        scheduler: Arc<dyn ScheduleControl>,
        registry: Arc<InstanceRegistry>,
        kill_timeout: Duration,
    ) -> Result<GroupManagerHandle, StratusError> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = GroupManagerHandle { tx: tx.clone() };

        let mut actor = GroupManagerActor {
            role: Role::Slave,
            caches: GroupCaches::new(),
            meta: meta.clone(),
            router,
            scheduler,
            registry,
            killing_groups: HashSet::new(),
            kill_timeout,
            mailbox: rx,
        };
        actor.load_and_watch(tx.clone()).await?;
        tokio::spawn(async move {
            actor.run().await;
        });
        Ok(handle)
    }

    /// Initial prefix read followed by watches from the next revision; watch
    /// events are translated into mailbox commands so every mutation runs
    /// in the actor's context.
    async fn load_and_watch(
        &mut self,
        tx: mpsc::Sender<GroupCommand>,
    ) -> Result<(), StratusError> {
        info!("start watching group info");
        let response = self
            .meta
            .get(
                GROUP_PATH_PREFIX,
                GetOptions {
                    prefix: true,
                    limit: 0,
                },
            )
            .await?;
        for kv in &response.kvs {
            match serde_json::from_str::<GroupInfo>(&kv.value) {
                Ok(group) => self.caches.add_group(&kv.key, group),
                Err(e) => error!("failed to parse group info at {}: {}", kv.key, e),
            }
        }
        let watch_opts = WatchOptions {
            prefix: true,
            prev_kv: true,
            revision: response.revision + 1,
        };
        let mut group_watch = self.meta.watch(GROUP_PATH_PREFIX, watch_opts).await?;
        let group_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(events) = group_watch.events.recv().await {
                for event in events {
                    let cmd = match event.event_type {
                        crate::core::meta::WatchEventType::Put => {
                            match serde_json::from_str::<GroupInfo>(&event.kv.value) {
                                Ok(group) => GroupCommand::GroupPut {
                                    key: event.kv.key.clone(),
                                    group,
                                },
                                Err(e) => {
                                    error!(
                                        "failed to parse group info at {}: {}",
                                        event.kv.key, e
                                    );
                                    continue;
                                }
                            }
                        }
                        crate::core::meta::WatchEventType::Delete => {
                            let Some(prev) = &event.prev_kv else { continue };
                            match serde_json::from_str::<GroupInfo>(&prev.value) {
                                Ok(group) => GroupCommand::GroupDelete { group },
                                Err(e) => {
                                    error!(
                                        "failed to parse deleted group info at {}: {}",
                                        event.kv.key, e
                                    );
                                    continue;
                                }
                            }
                        }
                    };
                    if group_tx.send(cmd).await.is_err() {
                        return;
                    }
                }
            }
        });

        let mut instance_watch = self
            .meta
            .watch(
                INSTANCE_PATH_PREFIX,
                WatchOptions {
                    prefix: true,
                    prev_kv: true,
                    revision: response.revision + 1,
                },
            )
            .await?;
        tokio::spawn(async move {
            while let Some(events) = instance_watch.events.recv().await {
                for event in events {
                    let cmd = match event.event_type {
                        crate::core::meta::WatchEventType::Put => {
                            match serde_json::from_str::<InstanceInfo>(&event.kv.value) {
                                Ok(info) => GroupCommand::InstancePut {
                                    key: event.kv.key.clone(),
                                    info,
                                },
                                Err(e) => {
                                    error!(
                                        "failed to parse instance info at {}: {}",
                                        event.kv.key, e
                                    );
                                    continue;
                                }
                            }
                        }
                        crate::core::meta::WatchEventType::Delete => {
                            let Some(prev) = &event.prev_kv else { continue };
                            match serde_json::from_str::<InstanceInfo>(&prev.value) {
                                Ok(info) => GroupCommand::InstanceDelete {
                                    key: event.kv.key.clone(),
                                    info,
                                },
                                Err(e) => {
                                    error!(
                                        "failed to parse deleted instance info at {}: {}",
                                        event.kv.key, e
                                    );
                                    continue;
                                }
                            }
                        }
                    };
                    if tx.send(cmd).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    async fn run(&mut self) {
        while let Some(cmd) = self.mailbox.recv().await {
            match cmd {
                GroupCommand::GroupPut { key, group } => self.on_group_put(&key, group).await,
                GroupCommand::GroupDelete { group } => self.on_group_delete(&group),
                GroupCommand::InstancePut { key, info } => self.on_instance_put(&key, info).await,
                GroupCommand::InstanceDelete { key, info } => {
                    self.on_instance_delete(&key, info).await
                }
                GroupCommand::InstanceFatal { info } => self.on_instance_fatal(info).await,
                GroupCommand::KillGroup {
                    group_id,
                    src_instance_id,
                    reply,
                } => {
                    let status = self.kill_group(&group_id, &src_instance_id).await;
                    let _ = reply.send(status);
                }
                GroupCommand::NodeAbnormal { node } => self.on_node_abnormal(&node).await,
                GroupCommand::RoleChange { role } => self.on_role_change(role).await,
                GroupCommand::Resync => self.resync().await,
                GroupCommand::Inspect { reply } => {
                    let _ = reply.send(self.caches.group_ids());
                }
            }
        }
    }

    fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    // ---- watch handlers ----------------------------------------------------

    async fn on_group_put(&mut self, key: &str, group: GroupInfo) {
        self.caches.add_group(key, group.clone());
        if !self.is_master() {
            return;
        }
        // A group whose parent already died must not outlive it.
        if let Some(parent_id) = group.parent_id.clone() {
            match self.registry.get(&parent_id) {
                None => {
                    info!(
                        "group({}) parent({}) is missing, killing group",
                        group.group_id, parent_id
                    );
                    let status = self.inner_kill_group(&group.group_id, &parent_id).await;
                    if status.is_err() {
                        warn!(
                            "failed to kill orphaned group {}: {}",
                            group.group_id, status.message
                        );
                    }
                }
                Some(parent) if parent.state == InstanceState::Fatal => {
                    let msg = format!(
                        "group({}) parent({}) is abnormal",
                        group.group_id, parent_id
                    );
                    self.fatal_group(&group.group_id, &parent_id, &msg).await;
                }
                Some(_) => {}
            }
        }
    }

    fn on_group_delete(&mut self, group: &GroupInfo) {
        self.caches.remove_group(&group.group_id);
    }

    async fn on_instance_put(&mut self, instance_key: &str, info: InstanceInfo) {
        let Some(group_id) = info.group_id.clone() else {
            debug!(
                "instance({}) doesn't belong to any group, ignored",
                info.instance_id
            );
            return;
        };
        if self.is_master() {
            let failed_message = self
                .caches
                .group_info(&group_id)
                .filter(|(_, g)| g.status == GroupState::Failed)
                .map(|(_, g)| g.message.clone());
            if let Some(message) = failed_message {
                if info.state.is_alive() {
                    // A straggler joined a group that already failed.
                    let msg = format!(
                        "instance exit with group together, reason: group({group_id}) failed due to {message}"
                    );
                    self.send_group_exit(&info, &msg).await;
                    return;
                }
            }
        }
        self.caches
            .add_group_instance(&group_id, instance_key, info);
    }

    /// Once an instance key is deleted, drop it from the cache; a deletion
    /// out of band (not via group kill) fails a same-lifecycle group.
    async fn on_instance_delete(&mut self, instance_key: &str, info: InstanceInfo) {
        let Some(group_id) = info.group_id.clone() else {
            // Even an ungrouped instance may parent groups.
            if self.is_master() {
                self.delete_child_groups(&info).await;
            }
            return;
        };
        self.caches.remove_group_instance(&group_id, instance_key);
        if !self.is_master() {
            return;
        }
        self.delete_child_groups(&info).await;

        let should_fail = self
            .caches
            .group_info(&group_id)
            .map(|(_, g)| {
                g.group_options.same_lifecycle
                    && g.status == GroupState::Running
                    && self.caches.group_instance_count(&group_id) > 0
            })
            .unwrap_or(false);
        if should_fail {
            let msg = format!(
                "instance killed separately: group({}) instance({}) deleted",
                group_id, info.instance_id
            );
            self.fatal_group(&group_id, &info.instance_id, &msg).await;
        }
    }

    async fn on_instance_fatal(&mut self, info: InstanceInfo) {
        if !self.is_master() {
            return;
        }
        // If the instance parents any group, those groups fail with it.
        for (child_key, child) in self.caches.child_groups(&info.instance_id) {
            let message = format!("group parent({}) failed", info.instance_id);
            let updated = self
                .mutate_group_cas(&child_key, |g| {
                    g.status = GroupState::Failed;
                    g.message = message.clone();
                })
                .await
                .unwrap_or_else(|| {
                    let mut fallback = child.clone();
                    fallback.status = GroupState::Failed;
                    fallback.message = message.clone();
                    fallback
                });
            self.caches.add_group(&child_key, updated);
        }

        let Some(group_id) = info.group_id.clone() else {
            return;
        };
        let msg = format!(
            "instance exit with group together, reason: group({}) instance({}) abnormal, instance exit code({})",
            group_id, info.instance_id, info.exit_code
        );
        self.fatal_group(&group_id, &info.instance_id, &msg).await;
    }

    // ---- failure cascade ---------------------------------------------------

    /// Transitions a group to FAILED (persisted first) and sends
    /// GROUP_EXIT_SIGNAL to every member except the one that caused it.
    async fn fatal_group(&mut self, group_id: &str, ignored_instance_id: &str, msg: &str) {
        let Some((key, group)) = self.caches.group_info(group_id).cloned() else {
            warn!("group({}) not found while marking failed", group_id);
            return;
        };
        if group.status == GroupState::Failed {
            warn!("group({}) already failed", group_id);
            return;
        }
        let member_count = self.caches.group_instance_count(group_id);
        debug!(
            "{}|{} check group({}) lifecycle: same={}, cached members={}",
            group.trace_id, group.request_id, group_id, group.group_options.same_lifecycle, member_count
        );
        if !group.group_options.same_lifecycle && member_count > 0 {
            warn!(
                "{}|{} group({}) does not share a running lifecycle, no cascade",
                group.trace_id, group.request_id, group_id
            );
            return;
        }
        let message = msg.to_string();
        let failed = match self
            .mutate_group_cas(&key, |g| {
                g.status = GroupState::Failed;
                g.message = message.clone();
            })
            .await
        {
            Some(updated) => updated,
            None => {
                // The record vanished under us; keep the cache honest anyway.
                let mut fallback = group.clone();
                fallback.status = GroupState::Failed;
                fallback.message = message.clone();
                self.persist_group(&key, &fallback).await;
                fallback
            }
        };
        self.caches.add_group(&key, failed);
        self.fatal_all_instances_of_group(group_id, ignored_instance_id, msg)
            .await;
    }

    async fn fatal_all_instances_of_group(
        &mut self,
        group_id: &str,
        ignored_instance_id: &str,
        msg: &str,
    ) {
        let members = self.caches.group_instances(group_id);
        for (_, member) in members {
            if member.instance_id == ignored_instance_id {
                continue;
            }
            self.send_group_exit(&member, msg).await;
        }
    }

    /// Routes a GROUP_EXIT kill to the instance's owner node.
    async fn send_group_exit(&self, info: &InstanceInfo, msg: &str) {
        let req = ForwardKillRequest::new(info, GROUP_MANAGER_OWNER, GROUP_EXIT_SIGNAL, msg);
        let Some(_) = self.router.resolve_address(&info.owner_node).await else {
            error!(
                "failed to kill instance {} in group {:?}: node {} address not found",
                info.instance_id, info.group_id, info.owner_node
            );
            return;
        };
        info!(
            "{}|send instance({}) kill request to node({})",
            req.request_id, info.instance_id, info.owner_node
        );
        let status = self.router.forward_kill(&info.owner_node, req).await;
        if status.is_err() {
            error!(
                "failed to kill instance {} on node {} in group {:?}: {}",
                info.instance_id, info.owner_node, info.group_id, status.message
            );
        }
    }

    async fn delete_child_groups(&mut self, info: &InstanceInfo) {
        let children = self.caches.child_groups(&info.instance_id);
        if children.is_empty() {
            return;
        }
        info!(
            "deleted instance({}) parents {} group(s), clearing them as well",
            info.instance_id,
            children.len()
        );
        for (_, child) in children {
            let status = self.clear_group_info(&child.group_id).await;
            if status.is_err() {
                warn!(
                    "failed to clear child group {}: {}",
                    child.group_id, status.message
                );
            }
        }
    }

    // ---- kill group --------------------------------------------------------

    async fn kill_group(&mut self, group_id: &str, src_instance_id: &str) -> Status {
        if !self.is_master() {
            return Status::new(
                StatusCode::InnerCommunication,
                "kill group routed to a slave group manager",
            );
        }
        if !self.killing_groups.insert(group_id.to_string()) {
            info!("repeated kill group({}) request, ignored", group_id);
            return Status::ok();
        }
        let status = self.inner_kill_group(group_id, src_instance_id).await;
        self.killing_groups.remove(group_id);
        status
    }

    /// Cancels still-scheduling members, shuts the running ones down, and
    /// clears the group record. A timeout reports REQUEST_TIME_OUT while the
    /// background cascade continues on the owner nodes.
    async fn inner_kill_group(&mut self, group_id: &str, src_instance_id: &str) -> Status {
        info!("start killing group {}", group_id);
        if let Some((_, group)) = self.caches.group_info(group_id) {
            if group.status == GroupState::Scheduling {
                self.scheduler
                    .try_cancel(group_id, &format!("group({group_id}) canceled"));
            }
        }
        let members = self.caches.group_instances(group_id);
        let mut kills = Vec::new();
        for (_, member) in &members {
            let req =
                ForwardKillRequest::new(member, src_instance_id, SHUT_DOWN_SIGNAL, "group killed");
            let router = self.router.clone();
            let node = member.owner_node.clone();
            let instance_id = member.instance_id.clone();
            kills.push(async move {
                let status = router.forward_kill(&node, req).await;
                if status.is_err() {
                    error!(
                        "failed to kill instance {} on node {}: {}",
                        instance_id, node, status.message
                    );
                }
                status
            });
        }
        let collected = tokio::time::timeout(self.kill_timeout, join_all(kills)).await;
        let status = match collected {
            Ok(statuses) => statuses
                .into_iter()
                .find(|s| s.is_err())
                .unwrap_or_else(Status::ok),
            Err(_) => Status::new(StatusCode::RequestTimeOut, "kill group timeout"),
        };
        // Even a timed-out kill clears the record; owner nodes keep
        // cascading in the background.
        let clear_status = self.clear_group_info(group_id).await;
        if status.is_err() {
            return status.with_detail(format!("kill group({group_id}) instances"));
        }
        clear_status
    }

    /// Routes a clear-group to the owner node, then deletes the meta key.
    async fn clear_group_info(&mut self, group_id: &str) -> Status {
        let Some((key, group)) = self.caches.group_info(group_id).cloned() else {
            return Status::new(
                StatusCode::GroupScheduleFailed,
                "group not found in group manager",
            );
        };
        match self.router.resolve_address(&group.owner_node).await {
            Some(_) => {
                let status = self
                    .router
                    .clear_group(&group.owner_node, group_id, &group.request_id)
                    .await;
                if status.is_err() {
                    warn!(
                        "failed to get clear group response, group: {}: {}",
                        key, status.message
                    );
                }
            }
            None => {
                warn!("{}|failed to clear group, node address not found", group_id);
            }
        }
        match self.meta.delete(&key).await {
            Ok(_) => Status::ok(),
            Err(e) => Status::new(
                StatusCode::MetaStorageDeleteError,
                format!("failed to delete group info from meta store, key {key}: {e}"),
            ),
        }
    }

    // ---- node failure ------------------------------------------------------

    /// Groups owned by a dead node: still-scheduling ones are forced FAILED
    /// and their members signalled; the manager takes over ownership.
    async fn on_node_abnormal(&mut self, node: &str) {
        if !self.is_master() {
            return;
        }
        let owned = self.caches.node_groups(node);
        info!("abnormal node({}) owns {} group(s)", node, owned.len());
        for (key, group) in owned {
            let was_scheduling = group.status == GroupState::Scheduling;
            let failure_message = format!("node({node}) failed while group was scheduling");
            let updated = self
                .mutate_group_cas(&key, |g| {
                    g.owner_node = GROUP_MANAGER_OWNER.to_string();
                    if was_scheduling {
                        g.status = GroupState::Failed;
                        g.message = failure_message.clone();
                    }
                })
                .await
                .unwrap_or_else(|| {
                    let mut fallback = group.clone();
                    fallback.owner_node = GROUP_MANAGER_OWNER.to_string();
                    if was_scheduling {
                        fallback.status = GroupState::Failed;
                        fallback.message = failure_message.clone();
                    }
                    fallback
                });
            self.caches.add_group(&key, updated.clone());
            if !was_scheduling {
                continue;
            }
            let members = self.caches.group_instances(&group.group_id);
            info!(
                "send GROUP_EXIT_SIGNAL to {} instance(s) of group {}",
                members.len(),
                group.group_id
            );
            let msg = format!(
                "instance exit with group together, reason: node({node}) failed"
            );
            for (_, member) in members {
                self.send_group_exit(&member, &msg).await;
            }
        }
    }

    // ---- master transition -------------------------------------------------

    /// On becoming master, repair cascades interrupted by the previous
    /// master's crash: every FAILED group gets its live members re-killed.
    async fn on_role_change(&mut self, role: Role) {
        if self.role == role {
            return;
        }
        self.role = role;
        if role != Role::Master {
            info!("group manager demoted to slave");
            return;
        }
        info!("group manager became master");
        for (_, group) in self.caches.groups() {
            if group.status != GroupState::Failed {
                continue;
            }
            info!("found failed group({}) during catch-up", group.group_id);
            let msg = format!(
                "instance exit with group together, reason: group({}) failed due to {}",
                group.group_id, group.message
            );
            for (_, member) in self.caches.group_instances(&group.group_id) {
                if matches!(
                    member.state,
                    InstanceState::Running | InstanceState::Creating
                ) {
                    info!(
                        "catch-up: instance({}) in failed group({}) still {}, killing",
                        member.instance_id, group.group_id, member.state
                    );
                    self.send_group_exit(&member, &msg).await;
                }
            }
        }
    }

    // ---- maintenance -------------------------------------------------------

    /// Re-reads the prefix after a watch lag; cache entries missing from the
    /// store are deleted locally.
    async fn resync(&mut self) {
        let result = match self.meta.sync(GROUP_PATH_PREFIX).await {
            Ok(result) => result,
            Err(e) => {
                error!("group resync failed: {}", e);
                return;
            }
        };
        let mut live = HashSet::new();
        for kv in &result.kvs {
            match serde_json::from_str::<GroupInfo>(&kv.value) {
                Ok(group) => {
                    live.insert(group.group_id.clone());
                    self.caches.add_group(&kv.key, group);
                }
                Err(e) => error!("failed to parse group info at {}: {}", kv.key, e),
            }
        }
        for group_id in self.caches.group_ids() {
            if !live.contains(&group_id) {
                debug!("resync: dropping stale group({}) from cache", group_id);
                self.caches.remove_group(&group_id);
            }
        }
    }

    async fn persist_group(&self, key: &str, group: &GroupInfo) {
        let value = match serde_json::to_string(group) {
            Ok(value) => value,
            Err(e) => {
                error!("failed to encode group({}) info: {}", group.group_id, e);
                return;
            }
        };
        if let Err(e) = self.meta.put(key, &value, None).await {
            error!("failed to put group({}) info in meta store: {}", key, e);
        }
    }

    /// Read-modify-write of a persisted group record under an expected-
    /// revision guard. A concurrent writer makes the CAS miss; the mutation
    /// is retried on the fresh value.
    async fn mutate_group_cas<F>(&self, key: &str, mutate: F) -> Option<GroupInfo>
    where
        F: Fn(&mut GroupInfo),
    {
        for _ in 0..GROUP_CAS_RETRIES {
            let response = match self.meta.get(key, GetOptions::default()).await {
                Ok(response) => response,
                Err(e) => {
                    error!("failed to read group record {}: {}", key, e);
                    return None;
                }
            };
            let Some(kv) = response.kvs.first() else {
                return None;
            };
            let mut group = match serde_json::from_str::<GroupInfo>(&kv.value) {
                Ok(group) => group,
                Err(e) => {
                    error!("failed to parse group record {}: {}", key, e);
                    return None;
                }
            };
            mutate(&mut group);
            let value = match serde_json::to_string(&group) {
                Ok(value) => value,
                Err(e) => {
                    error!("failed to encode group record {}: {}", key, e);
                    return None;
                }
            };
            match self.meta.put_if_revision(key, &value, kv.mod_revision).await {
                Ok(true) => return Some(group),
                Ok(false) => {
                    debug!("group record {} changed underneath, retrying mutation", key);
                    continue;
                }
                Err(e) => {
                    error!("failed to put group record {}: {}", key, e);
                    return None;
                }
            }
        }
        warn!("group record {} kept changing, mutation abandoned", key);
        None
    }
}
