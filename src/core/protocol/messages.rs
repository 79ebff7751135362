// src/core/protocol/messages.rs

//! Every message that can travel on the wire, as one tagged `Frame` enum.

use crate::core::errors::{Status, StatusCode};
use crate::core::instances::{InstanceInfo, ScheduleOptions};
use crate::core::resources::{ResourceUnit, Resources};
use crate::core::scheduler::item::GroupOptions;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A serialized argument: either an inline buffer or a reference to an
/// object already living in the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Inline(Bytes),
    ObjectRef(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub request_id: String,
    pub trace_id: String,
    pub tenant_id: String,
    pub function_urn: String,
    pub args: Vec<Arg>,
    pub return_object_ids: Vec<String>,
    pub labels: Vec<String>,
    pub resources: Resources,
    pub schedule_options: ScheduleOptions,
    pub concurrency: u32,
    pub named_instance: Option<String>,
    pub group_id: Option<String>,
    pub parent_instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateResponse {
    pub request_id: String,
    pub status: Status,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub request_id: String,
    pub trace_id: String,
    pub instance_id: String,
    pub function_urn: String,
    pub args: Vec<Arg>,
    pub return_object_ids: Vec<String>,
    /// Assigned by the invoke-order manager when the caller asked for
    /// ordering; ignored otherwise.
    pub invoke_seq: u64,
    /// The lowest sequence not yet completed, letting the instance runtime
    /// enforce deterministic execution order.
    pub unfinished_seq: u64,
    pub need_order: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub request_id: String,
    pub status: Status,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillRequest {
    pub request_id: String,
    pub instance_id: String,
    pub signal: i32,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillResponse {
    pub request_id: String,
    pub status: Status,
    /// Accelerate replies carry the queue handle here.
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: String,
    /// Request ids of in-flight creates/invokes to cancel; the client
    /// resolves object ids to request ids through its request manager.
    pub target_request_ids: Vec<String>,
    pub is_force: bool,
    pub is_recursive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub request_id: String,
    pub trace_id: String,
    pub tenant_id: String,
    pub group_options: GroupOptions,
    /// Range groups carry a single body request; function groups fan out
    /// one request per member.
    pub requests: Vec<CreateRequest>,
    pub return_object_id: String,
    pub parent_instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateGroupResponse {
    pub request_id: String,
    pub status: Status,
    pub group_id: String,
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillGroupRequest {
    pub request_id: String,
    pub group_id: String,
    pub src_instance_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroupRequest {
    pub request_id: String,
    pub name: String,
    /// Unit ids carved into the group.
    pub unit_ids: Vec<String>,
}

/// A generic acknowledgement for requests without a richer reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleResponse {
    pub request_id: String,
    pub status: Status,
}

/// One completed return object inside a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyResult {
    pub object_id: String,
    pub payload: Option<Bytes>,
}

/// The asynchronous completion of a prior create/invoke, correlated by
/// request id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub request_id: String,
    pub code: i32,
    pub message: String,
    pub results: Vec<NotifyResult>,
    pub instance_ids: Vec<String>,
}

impl NotifyRequest {
    pub fn code(&self) -> StatusCode {
        status_code_from_wire(self.code)
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success as i32
    }
}

/// Maps a raw wire code back onto the typed enumeration, folding unknown
/// codes to the common failure.
pub fn status_code_from_wire(code: i32) -> StatusCode {
    match code {
        x if x == StatusCode::Success as i32 => StatusCode::Success,
        x if x == StatusCode::RequestTimeOut as i32 => StatusCode::RequestTimeOut,
        x if x == StatusCode::ParameterError as i32 => StatusCode::ParameterError,
        x if x == StatusCode::JsonParseError as i32 => StatusCode::JsonParseError,
        x if x == StatusCode::ResourceNotEnough as i32 => StatusCode::ResourceNotEnough,
        x if x == StatusCode::AffinityScheduleFailed as i32 => StatusCode::AffinityScheduleFailed,
        x if x == StatusCode::NoPreemptableInstance as i32 => StatusCode::NoPreemptableInstance,
        x if x == StatusCode::ScheduleCanceled as i32 => StatusCode::ScheduleCanceled,
        x if x == StatusCode::GroupScheduleFailed as i32 => StatusCode::GroupScheduleFailed,
        x if x == StatusCode::GroupParentFailed as i32 => StatusCode::GroupParentFailed,
        x if x == StatusCode::GroupExitTogether as i32 => StatusCode::GroupExitTogether,
        x if x == StatusCode::InstanceNotFound as i32 => StatusCode::InstanceNotFound,
        x if x == StatusCode::HeartbeatLost as i32 => StatusCode::HeartbeatLost,
        x if x == StatusCode::SubHealth as i32 => StatusCode::SubHealth,
        x if x == StatusCode::UserCodeLoad as i32 => StatusCode::UserCodeLoad,
        x if x == StatusCode::UserFunctionException as i32 => StatusCode::UserFunctionException,
        x if x == StatusCode::RequestBetweenRuntimeBus as i32 => {
            StatusCode::RequestBetweenRuntimeBus
        }
        x if x == StatusCode::InnerCommunication as i32 => StatusCode::InnerCommunication,
        x if x == StatusCode::InnerSystemError as i32 => StatusCode::InnerSystemError,
        x if x == StatusCode::MetaStoragePutError as i32 => StatusCode::MetaStoragePutError,
        x if x == StatusCode::MetaStorageDeleteError as i32 => StatusCode::MetaStorageDeleteError,
        x if x == StatusCode::MetaStorageWatchError as i32 => StatusCode::MetaStorageWatchError,
        x if x == StatusCode::Finalized as i32 => StatusCode::Finalized,
        _ => StatusCode::CommonFail,
    }
}

/// A custom signal pushed from the server to an instance's runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub instance_id: String,
    pub signal: i32,
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub instance_id: String,
    pub state_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoverRequest {
    pub instance_id: String,
    pub state_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub grace_period_sec: u64,
}

/// Everything that travels on the stream, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    // client → server
    Create(CreateRequest),
    Invoke(InvokeRequest),
    Kill(KillRequest),
    Cancel(CancelRequest),
    CreateGroup(CreateGroupRequest),
    KillGroup(KillGroupRequest),
    CreateResourceGroup(ResourceGroupRequest),
    RemoveResourceGroup { request_id: String, name: String },
    QueryResources { request_id: String },
    QueryNamedInstances { request_id: String },
    QueryResourceGroup { request_id: String, name: String },
    Heartbeat { instance_id: String },
    Exit,

    // server → client acknowledgements
    CreateResponse(CreateResponse),
    InvokeResponse(InvokeResponse),
    KillResponse(KillResponse),
    CancelResponse(SimpleResponse),
    CreateGroupResponse(CreateGroupResponse),
    KillGroupResponse(SimpleResponse),
    ResourceGroupResponse(SimpleResponse),
    QueryResourcesResponse {
        request_id: String,
        units: Vec<ResourceUnit>,
    },
    QueryNamedInstancesResponse {
        request_id: String,
        instances: Vec<InstanceInfo>,
    },
    QueryResourceGroupResponse {
        request_id: String,
        status: Status,
        units: Vec<ResourceUnit>,
    },

    // server → client asynchronous pushes
    Notify(NotifyRequest),
    Signal(SignalRequest),
    Checkpoint(CheckpointRequest),
    Recover(RecoverRequest),
    Shutdown(ShutdownRequest),
}

impl Frame {
    /// The request id an acknowledgement correlates on, when it has one.
    pub fn ack_request_id(&self) -> Option<&str> {
        match self {
            Frame::CreateResponse(r) => Some(&r.request_id),
            Frame::InvokeResponse(r) => Some(&r.request_id),
            Frame::KillResponse(r) => Some(&r.request_id),
            Frame::CancelResponse(r) => Some(&r.request_id),
            Frame::CreateGroupResponse(r) => Some(&r.request_id),
            Frame::KillGroupResponse(r) => Some(&r.request_id),
            Frame::ResourceGroupResponse(r) => Some(&r.request_id),
            Frame::QueryResourcesResponse { request_id, .. }
            | Frame::QueryNamedInstancesResponse { request_id, .. }
            | Frame::QueryResourceGroupResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}
