// src/server/dispatch.rs

//! Request dispatch: turns inbound frames into scheduler work, group
//! manager commands, and registry mutations. Submission is acknowledged
//! immediately; completions are pushed later as `Notify` frames to the
//! originating session.

use crate::core::errors::{Status, StatusCode};
use crate::core::instances::{instance_key, InstanceInfo, InstanceState};
use crate::core::metrics;
use crate::core::protocol::{
    CancelRequest, CreateGroupRequest, CreateGroupResponse, CreateRequest, CreateResponse, Frame,
    InvokeRequest, InvokeResponse, KillGroupRequest, KillRequest, KillResponse, NotifyRequest,
    ResourceGroupRequest, SimpleResponse,
};
use crate::core::groups::{group_key, GroupInfo, GroupState};
use crate::core::scheduler::item::{GroupScheduleItem, InstanceItem, QueueItem};
use crate::core::scheduler::{Placement, ScheduleResult};
use crate::core::signal;
use crate::core::state::{SchedulerMsg, ServerState};
use crate::core::validate;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handles one inbound frame; the returned frame (if any) is the immediate
/// acknowledgement written back on the stream.
pub async fn handle_frame(
    state: &Arc<ServerState>,
    session_id: u64,
    frame: Frame,
) -> Option<Frame> {
    match frame {
        Frame::Create(req) => Some(handle_create(state, session_id, req).await),
        Frame::Invoke(req) => Some(handle_invoke(state, session_id, req).await),
        Frame::Kill(req) => Some(handle_kill(state, req).await),
        Frame::Cancel(req) => Some(handle_cancel(state, req).await),
        Frame::CreateGroup(req) => Some(handle_create_group(state, session_id, req).await),
        Frame::KillGroup(req) => Some(handle_kill_group(state, req).await),
        Frame::CreateResourceGroup(req) => Some(handle_create_resource_group(state, req)),
        Frame::RemoveResourceGroup { request_id, name } => {
            let status = state.rgroups.remove(&state.view, &name);
            Some(Frame::ResourceGroupResponse(SimpleResponse {
                request_id,
                status,
            }))
        }
        Frame::QueryResources { request_id } => Some(Frame::QueryResourcesResponse {
            request_id,
            units: state.view.snapshot().units,
        }),
        Frame::QueryNamedInstances { request_id } => Some(Frame::QueryNamedInstancesResponse {
            request_id,
            instances: state.registry.list_named(),
        }),
        Frame::QueryResourceGroup { request_id, name } => {
            Some(handle_query_resource_group(state, request_id, &name))
        }
        Frame::Heartbeat { instance_id } => {
            state.registry.record_heartbeat(&instance_id);
            None
        }
        Frame::Exit => None,
        other => {
            warn!("unexpected frame on session {}: {:?}", session_id, other);
            None
        }
    }
}

fn validate_create(req: &CreateRequest) -> Result<(), Status> {
    validate::validate_function_name(&req.function_urn).map_err(Status::from)?;
    validate::validate_labels(&req.labels).map_err(Status::from)?;
    validate::validate_concurrency(req.concurrency).map_err(Status::from)?;
    if req.return_object_ids.is_empty() {
        return Err(Status::new(
            StatusCode::ParameterError,
            "create request carries no return object ids",
        ));
    }
    Ok(())
}

/// Group member bodies carry synthesized `{group}_bundle_{i}` labels that
/// are exempt from the user-label charset; everything else still applies.
fn validate_group_body(req: &CreateRequest) -> Result<(), Status> {
    validate::validate_function_name(&req.function_urn).map_err(Status::from)?;
    validate::validate_concurrency(req.concurrency).map_err(Status::from)?;
    Ok(())
}

fn instance_from_create(req: &CreateRequest, group_id: Option<String>) -> InstanceInfo {
    InstanceInfo {
        instance_id: format!("inst-{}", Uuid::new_v4()),
        request_id: req.request_id.clone(),
        trace_id: req.trace_id.clone(),
        function_urn: req.function_urn.clone(),
        owner_node: String::new(),
        resources: req.resources.clone(),
        labels: req.labels.clone(),
        schedule_options: req.schedule_options.clone(),
        state: InstanceState::Scheduling,
        exit_code: 0,
        group_id: group_id.or_else(|| req.group_id.clone()),
        parent_instance_id: req.parent_instance_id.clone(),
        named_instance: req.named_instance.clone(),
        sub_health: false,
    }
}

async fn handle_create(
    state: &Arc<ServerState>,
    session_id: u64,
    req: CreateRequest,
) -> Frame {
    if let Err(status) = validate_create(&req) {
        return Frame::CreateResponse(CreateResponse {
            request_id: req.request_id,
            status,
            instance_id: None,
        });
    }
    let info = instance_from_create(&req, None);
    let instance_id = info.instance_id.clone();
    state.registry.upsert(info.clone());
    if let Err(e) = state.registry.persist(&state.meta, &instance_id).await {
        error!("failed to persist instance {}: {}", instance_id, e);
    }

    let (item, result_rx) = InstanceItem::new(info);
    if state
        .scheduler_tx
        .send(SchedulerMsg::Enqueue(QueueItem::Instance(item)))
        .await
        .is_err()
    {
        return Frame::CreateResponse(CreateResponse {
            request_id: req.request_id,
            status: Status::new(StatusCode::InnerCommunication, "scheduler unavailable"),
            instance_id: None,
        });
    }

    // Completion continues asynchronously; the submitter only learns the
    // request was queued.
    let state = state.clone();
    let return_object_ids = req.return_object_ids.clone();
    let request_id = req.request_id.clone();
    let instance_id_task = instance_id.clone();
    tokio::spawn(async move {
        let instance_id = instance_id_task;
        let result = match result_rx.await {
            Ok(result) => result,
            Err(_) => ScheduleResult::failure(
                StatusCode::InnerSystemError,
                "schedule promise dropped",
            ),
        };
        let code_label = result.code.to_string();
        metrics::SCHEDULE_RESULTS_TOTAL
            .with_label_values(&[code_label.as_str()])
            .inc();
        let notify = if result.is_success() {
            match commit_placements(&state, &result.placements).await {
                Ok(()) => NotifyRequest {
                    request_id: request_id.clone(),
                    code: StatusCode::Success as i32,
                    message: String::new(),
                    results: return_object_ids
                        .iter()
                        .map(|id| crate::core::protocol::NotifyResult {
                            object_id: id.clone(),
                            payload: None,
                        })
                        .collect(),
                    instance_ids: vec![instance_id.clone()],
                },
                Err(status) => {
                    fail_instance(&state, &instance_id).await;
                    NotifyRequest {
                        request_id: request_id.clone(),
                        code: status.code as i32,
                        message: status.message,
                        results: Vec::new(),
                        instance_ids: Vec::new(),
                    }
                }
            }
        } else {
            fail_instance(&state, &instance_id).await;
            NotifyRequest {
                request_id: request_id.clone(),
                code: result.code as i32,
                message: result.reason,
                results: Vec::new(),
                instance_ids: Vec::new(),
            }
        };
        state.push_to_client(session_id, Frame::Notify(notify)).await;
    });

    Frame::CreateResponse(CreateResponse {
        request_id: req.request_id,
        status: Status::ok(),
        instance_id: Some(instance_id),
    })
}

/// Applies committed placements to the authoritative state: victims are
/// killed and removed, the instance lands on its unit, the owner node
/// materializes it, and the registry/meta records advance to Running.
async fn commit_placements(
    state: &Arc<ServerState>,
    placements: &[Placement],
) -> Result<(), Status> {
    for placement in placements {
        for victim in &placement.evicted {
            evict_victim(state, placement, victim).await;
        }
        let Some(mut info) = state.registry.get(&placement.instance_id) else {
            return Err(Status::new(
                StatusCode::InstanceNotFound,
                format!("placed instance {} vanished", placement.instance_id),
            ));
        };
        info.owner_node = placement.owner_id.clone();
        info.state = InstanceState::Creating;
        state.registry.upsert(info.clone());
        state
            .view
            .add_instances(&placement.unit_id, vec![info.clone()])
            .map_err(|e| Status::new(StatusCode::InnerSystemError, e.to_string()))?;

        let status = state.router.materialize(&placement.owner_id, &info).await;
        if status.is_err() {
            let _ = state
                .view
                .remove_instances(&placement.unit_id, &[placement.instance_id.clone()]);
            return Err(status);
        }
        info.state = InstanceState::Running;
        state.registry.upsert(info.clone());
        if let Err(e) = state.registry.persist(&state.meta, &info.instance_id).await {
            error!("failed to persist instance {}: {}", info.instance_id, e);
        }
        info!(
            "{}|instance({}) running on unit({}) node({})",
            info.request_id, info.instance_id, placement.unit_id, placement.owner_id
        );
    }
    Ok(())
}

async fn evict_victim(state: &Arc<ServerState>, placement: &Placement, victim: &InstanceInfo) {
    metrics::PREEMPTIONS_TOTAL.inc();
    info!(
        "preempting instance({}) on unit({}) for {}",
        victim.instance_id, placement.unit_id, placement.instance_id
    );
    let req = crate::core::instances::ForwardKillRequest::new(
        victim,
        &placement.instance_id,
        signal::SHUT_DOWN_SIGNAL,
        "preempted by a higher-priority instance",
    );
    let status = state.router.forward_kill(&victim.owner_node, req).await;
    if status.is_err() {
        warn!(
            "failed to deliver preemption kill to {}: {}",
            victim.instance_id, status.message
        );
    }
    let _ = state
        .view
        .remove_instances(&placement.unit_id, &[victim.instance_id.clone()]);
    state.registry.remove(&victim.instance_id);
    let _ = state.meta.delete(&instance_key(&victim.instance_id)).await;
}

/// Drops a failed instance's records.
async fn fail_instance(state: &Arc<ServerState>, instance_id: &str) {
    state.registry.remove(instance_id);
    let _ = state.meta.delete(&instance_key(instance_id)).await;
}

async fn handle_invoke(
    state: &Arc<ServerState>,
    session_id: u64,
    req: InvokeRequest,
) -> Frame {
    let Some(info) = state
        .registry
        .get(&req.instance_id)
        .or_else(|| state.registry.resolve_named(&req.instance_id))
    else {
        return Frame::InvokeResponse(InvokeResponse {
            request_id: req.request_id,
            status: Status::new(
                StatusCode::InstanceNotFound,
                format!("instance {} not found", req.instance_id),
            ),
        });
    };
    if !matches!(info.state, InstanceState::Creating | InstanceState::Running) {
        return Frame::InvokeResponse(InvokeResponse {
            request_id: req.request_id,
            status: Status::new(
                StatusCode::InstanceNotFound,
                format!("instance {} is {}", info.instance_id, info.state),
            ),
        });
    }
    let request_id = req.request_id.clone();
    let state = state.clone();
    tokio::spawn(async move {
        let notify = state.router.forward_invoke(&info.owner_node, req).await;
        state.push_to_client(session_id, Frame::Notify(notify)).await;
    });
    Frame::InvokeResponse(InvokeResponse {
        request_id,
        status: Status::ok(),
    })
}

async fn handle_kill(state: &Arc<ServerState>, req: KillRequest) -> Frame {
    debug!(
        "{}|kill instance({}) signal({})",
        req.request_id, req.instance_id, req.signal
    );
    if req.signal == signal::KILL_ALL_INSTANCES {
        for info in state.registry.list() {
            kill_one_instance(state, &info, req.signal, &req.payload).await;
        }
        return Frame::KillResponse(KillResponse {
            request_id: req.request_id,
            status: Status::ok(),
            message: String::new(),
        });
    }
    let Some(info) = state
        .registry
        .get(&req.instance_id)
        .or_else(|| state.registry.resolve_named(&req.instance_id))
    else {
        return Frame::KillResponse(KillResponse {
            request_id: req.request_id,
            status: Status::new(
                StatusCode::InstanceNotFound,
                format!("instance {} not found", req.instance_id),
            ),
            message: String::new(),
        });
    };
    if req.signal == signal::ACCELERATE {
        // The accelerate handshake replies with the queue handle recorded
        // for the instance; the data path itself is owned by the runtimes.
        return Frame::KillResponse(KillResponse {
            request_id: req.request_id,
            status: Status::ok(),
            message: format!("amq-{}", info.instance_id),
        });
    }
    kill_one_instance(state, &info, req.signal, &req.payload).await;
    Frame::KillResponse(KillResponse {
        request_id: req.request_id,
        status: Status::ok(),
        message: String::new(),
    })
}

async fn kill_one_instance(
    state: &Arc<ServerState>,
    info: &InstanceInfo,
    sig: i32,
    payload: &str,
) {
    let req = crate::core::instances::ForwardKillRequest::new(info, "", sig, payload);
    let status = state.router.forward_kill(&info.owner_node, req).await;
    if status.is_err() {
        warn!(
            "failed to deliver kill to instance {}: {}",
            info.instance_id, status.message
        );
    }
    if let Some(unit_id) = state.view.find_instance_unit(&info.instance_id) {
        let _ = state
            .view
            .remove_instances(&unit_id, &[info.instance_id.clone()]);
    }
    state.registry.remove(&info.instance_id);
    let _ = state.meta.delete(&instance_key(&info.instance_id)).await;
}

async fn handle_cancel(state: &Arc<ServerState>, req: CancelRequest) -> Frame {
    for target in &req.target_request_ids {
        let _ = state
            .scheduler_tx
            .send(SchedulerMsg::Cancel {
                id: target.clone(),
                reason: format!("canceled by request {}", req.request_id),
            })
            .await;
    }
    Frame::CancelResponse(SimpleResponse {
        request_id: req.request_id,
        status: Status::ok(),
    })
}

async fn handle_create_group(
    state: &Arc<ServerState>,
    session_id: u64,
    req: CreateGroupRequest,
) -> Frame {
    if req.requests.is_empty() {
        return Frame::CreateGroupResponse(CreateGroupResponse {
            request_id: req.request_id,
            status: Status::new(StatusCode::ParameterError, "group carries no requests"),
            group_id: String::new(),
            instance_ids: Vec::new(),
        });
    }
    for body in &req.requests {
        if let Err(status) = validate_group_body(body) {
            return Frame::CreateGroupResponse(CreateGroupResponse {
                request_id: req.request_id,
                status,
                group_id: String::new(),
                instance_ids: Vec::new(),
            });
        }
    }
    let group_id = format!("group-{}", Uuid::new_v4());
    let group_info = GroupInfo {
        group_id: group_id.clone(),
        owner_node: "local".to_string(),
        parent_id: req.parent_instance_id.clone(),
        status: GroupState::Scheduling,
        message: String::new(),
        trace_id: req.trace_id.clone(),
        request_id: req.request_id.clone(),
        group_options: req.group_options.clone(),
    };
    if let Err(e) = persist_group(state, &group_info).await {
        return Frame::CreateGroupResponse(CreateGroupResponse {
            request_id: req.request_id,
            status: e,
            group_id: String::new(),
            instance_ids: Vec::new(),
        });
    }

    // Range groups replicate the single body request across the range.
    let bodies: Vec<CreateRequest> = if req.group_options.is_range {
        let total = req.group_options.total_size.max(1);
        std::iter::repeat(req.requests[0].clone()).take(total).collect()
    } else {
        req.requests.clone()
    };
    let mut members = Vec::with_capacity(bodies.len());
    for body in &bodies {
        let info = instance_from_create(body, Some(group_id.clone()));
        state.registry.upsert(info.clone());
        if let Err(e) = state.registry.persist(&state.meta, &info.instance_id).await {
            error!("failed to persist instance {}: {}", info.instance_id, e);
        }
        members.push(info);
    }
    let member_ids: Vec<String> = members.iter().map(|m| m.instance_id.clone()).collect();

    let (item, result_rx) = GroupScheduleItem::new(
        req.request_id.clone(),
        group_id.clone(),
        req.group_options.clone(),
        members,
    );
    if state
        .scheduler_tx
        .send(SchedulerMsg::Enqueue(QueueItem::Group(item)))
        .await
        .is_err()
    {
        return Frame::CreateGroupResponse(CreateGroupResponse {
            request_id: req.request_id,
            status: Status::new(StatusCode::InnerCommunication, "scheduler unavailable"),
            group_id,
            instance_ids: Vec::new(),
        });
    }

    let state_cloned = state.clone();
    let request_id = req.request_id.clone();
    let return_object_id = req.return_object_id.clone();
    let group_id_cloned = group_id.clone();
    let member_ids_cloned = member_ids.clone();
    let mut group_record = group_info;
    tokio::spawn(async move {
        let state = state_cloned;
        let result = match result_rx.await {
            Ok(result) => result,
            Err(_) => ScheduleResult::failure(
                StatusCode::InnerSystemError,
                "schedule promise dropped",
            ),
        };
        let code_label = result.code.to_string();
        metrics::SCHEDULE_RESULTS_TOTAL
            .with_label_values(&[code_label.as_str()])
            .inc();
        let notify = if result.is_success() {
            match commit_placements(&state, &result.placements).await {
                Ok(()) => {
                    group_record.status = GroupState::Running;
                    if let Err(status) = persist_group(&state, &group_record).await {
                        warn!(
                            "group({}) running but status not persisted: {}",
                            group_record.group_id, status.message
                        );
                    }
                    NotifyRequest {
                        request_id: request_id.clone(),
                        code: StatusCode::Success as i32,
                        message: group_id_cloned.clone(),
                        results: vec![crate::core::protocol::NotifyResult {
                            object_id: return_object_id.clone(),
                            payload: None,
                        }],
                        instance_ids: member_ids_cloned.clone(),
                    }
                }
                Err(status) => {
                    fail_group(&state, &group_id_cloned, &member_ids_cloned, &status.message)
                        .await;
                    NotifyRequest {
                        request_id: request_id.clone(),
                        code: status.code as i32,
                        message: status.message,
                        results: Vec::new(),
                        instance_ids: Vec::new(),
                    }
                }
            }
        } else {
            fail_group(&state, &group_id_cloned, &member_ids_cloned, &result.reason).await;
            NotifyRequest {
                request_id: request_id.clone(),
                code: result.code as i32,
                message: result.reason,
                results: Vec::new(),
                instance_ids: Vec::new(),
            }
        };
        state.push_to_client(session_id, Frame::Notify(notify)).await;
    });

    Frame::CreateGroupResponse(CreateGroupResponse {
        request_id: req.request_id,
        status: Status::ok(),
        group_id,
        instance_ids: member_ids,
    })
}

async fn persist_group(state: &Arc<ServerState>, group: &GroupInfo) -> Result<(), Status> {
    let value = serde_json::to_string(group)
        .map_err(|e| Status::new(StatusCode::JsonParseError, e.to_string()))?;
    state
        .meta
        .put(&group_key(&group.group_id), &value, None)
        .await
        .map_err(|e| Status::new(StatusCode::MetaStoragePutError, e.to_string()))?;
    Ok(())
}

/// An unschedulable group leaves nothing behind: member records are dropped
/// and the group key deleted.
async fn fail_group(
    state: &Arc<ServerState>,
    group_id: &str,
    member_ids: &[String],
    reason: &str,
) {
    warn!("group({}) schedule failed: {}", group_id, reason);
    for member in member_ids {
        fail_instance(state, member).await;
    }
    let _ = state.meta.delete(&group_key(group_id)).await;
}

async fn handle_kill_group(state: &Arc<ServerState>, req: KillGroupRequest) -> Frame {
    metrics::GROUP_KILLS_TOTAL.inc();
    let status = state
        .group_manager
        .kill_group(&req.group_id, &req.src_instance_id)
        .await;
    Frame::KillGroupResponse(SimpleResponse {
        request_id: req.request_id,
        status,
    })
}

fn handle_create_resource_group(state: &Arc<ServerState>, req: ResourceGroupRequest) -> Frame {
    let status = state.rgroups.create(&state.view, &req.name, req.unit_ids);
    Frame::ResourceGroupResponse(SimpleResponse {
        request_id: req.request_id,
        status,
    })
}

fn handle_query_resource_group(
    state: &Arc<ServerState>,
    request_id: String,
    name: &str,
) -> Frame {
    let Some(record) = state.rgroups.get(name) else {
        return Frame::QueryResourceGroupResponse {
            request_id,
            status: Status::new(
                StatusCode::ParameterError,
                format!("resource group {name} does not exist"),
            ),
            units: Vec::new(),
        };
    };
    let snapshot = state.view.snapshot();
    let units = snapshot
        .units
        .into_iter()
        .filter(|u| record.unit_ids.contains(&u.unit_id))
        .collect();
    Frame::QueryResourceGroupResponse {
        request_id,
        status: Status::ok(),
        units,
    }
}
