// src/core/router.rs

//! The outbound seam towards worker nodes: address resolution, instance
//! materialization, invocation forwarding, and control signals. Real
//! deployments implement this over the node transport; the loopback
//! implementation backs single-process runs and tests.

use crate::core::errors::{Status, StatusCode};
use crate::core::instances::{ForwardKillRequest, InstanceInfo};
use crate::core::protocol::{InvokeRequest, NotifyRequest, NotifyResult};
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait NodeRouter: Send + Sync {
    /// Resolves a node's address; `None` means the node is unreachable.
    async fn resolve_address(&self, node: &str) -> Option<String>;

    /// Tells a node to materialize a freshly placed instance.
    async fn materialize(&self, node: &str, info: &InstanceInfo) -> Status;

    /// Forwards an invocation to the instance's owner node; the returned
    /// notification carries the completion.
    async fn forward_invoke(&self, node: &str, req: InvokeRequest) -> NotifyRequest;

    /// Delivers a kill order to an instance's owner node.
    async fn forward_kill(&self, node: &str, req: ForwardKillRequest) -> Status;

    /// Routes a clear-group message to the group's owner node.
    async fn clear_group(&self, node: &str, group_id: &str, group_request_id: &str) -> Status;
}

/// Accepts every order and answers invokes by echoing the inline arguments
/// into the first return object. Deterministic enough for embedded runs and
/// for tests that assert control-plane state.
#[derive(Debug, Default)]
pub struct LoopbackRouter;

#[async_trait]
impl NodeRouter for LoopbackRouter {
    async fn resolve_address(&self, node: &str) -> Option<String> {
        Some(node.to_string())
    }

    async fn materialize(&self, _node: &str, _info: &InstanceInfo) -> Status {
        Status::ok()
    }

    async fn forward_invoke(&self, _node: &str, req: InvokeRequest) -> NotifyRequest {
        let echoed: Vec<u8> = req
            .args
            .iter()
            .filter_map(|arg| match arg {
                crate::core::protocol::Arg::Inline(data) => Some(data.as_ref()),
                crate::core::protocol::Arg::ObjectRef(_) => None,
            })
            .flatten()
            .copied()
            .collect();
        let results = req
            .return_object_ids
            .iter()
            .enumerate()
            .map(|(i, id)| NotifyResult {
                object_id: id.clone(),
                payload: if i == 0 {
                    Some(Bytes::from(echoed.clone()))
                } else {
                    Some(Bytes::new())
                },
            })
            .collect();
        NotifyRequest {
            request_id: req.request_id,
            code: StatusCode::Success as i32,
            message: String::new(),
            results,
            instance_ids: vec![req.instance_id],
        }
    }

    async fn forward_kill(&self, _node: &str, _req: ForwardKillRequest) -> Status {
        Status::ok()
    }

    async fn clear_group(&self, _node: &str, _group_id: &str, _request_id: &str) -> Status {
        Status::ok()
    }
}
