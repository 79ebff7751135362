// src/client/group.rs

//! Range and function-group creation. A range group ships one body request
//! with a group-options envelope; a function group fans out one request per
//! member, co-locating bundles through synthesized `{group}_bundle_{i}`
//! labels that the scheduler's affinity machinery interprets.

use super::adaptor::{InvokeAdaptor, ObjRef};
use super::spec::{FunctionMeta, InvokeOptions, InvokeSpec, InvokeType};
use crate::core::errors::{Status, StatusCode, StratusError};
use crate::core::protocol::{Arg, CreateGroupRequest, CreateRequest, Frame};
use crate::core::resources::{LabelExpression, Selector, SelectorSet};
use crate::core::scheduler::item::GroupOptions;
use crate::core::signal;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Options of a function-group creation.
#[derive(Debug, Clone)]
pub struct FunctionGroupOptions {
    pub timeout_ms: u64,
    pub same_lifecycle: bool,
    pub bundle_size: usize,
    pub group_size: usize,
}

impl Default for FunctionGroupOptions {
    fn default() -> Self {
        FunctionGroupOptions {
            timeout_ms: 60_000,
            same_lifecycle: true,
            bundle_size: 1,
            group_size: 1,
        }
    }
}

/// A created group of instances sharing a lifecycle and a co-location
/// layout. The group's return object carries the member instance ids.
pub struct FunctionGroup {
    adaptor: Arc<InvokeAdaptor>,
    name: String,
    opts: FunctionGroupOptions,
    return_object_id: Mutex<Option<String>>,
    group_id: Mutex<Option<String>>,
}

impl FunctionGroup {
    pub fn new(adaptor: Arc<InvokeAdaptor>, name: impl Into<String>, opts: FunctionGroupOptions) -> Self {
        FunctionGroup {
            adaptor,
            name: name.into(),
            opts,
            return_object_id: Mutex::new(None),
            group_id: Mutex::new(None),
        }
    }

    pub fn group_id(&self) -> Option<String> {
        self.group_id.lock().clone()
    }

    pub fn handle(&self) -> Option<ObjRef> {
        self.return_object_id
            .lock()
            .as_ref()
            .map(|id| ObjRef { id: id.clone() })
    }

    /// Synthesizes the member create requests: the first member of each
    /// bundle declares the bundle label, the rest require it.
    fn assemble_member_requests(&self, body: &CreateRequest) -> Vec<CreateRequest> {
        let bundle_label_prefix = format!("{}_bundle_", self.name);
        let bundle_size = self.opts.bundle_size.max(1);
        let mut members = Vec::with_capacity(self.opts.group_size);
        for i in 0..self.opts.group_size {
            let bundle_label = format!("{bundle_label_prefix}{}", i / bundle_size);
            let mut member = body.clone();
            member.request_id = Uuid::new_v4().to_string();
            if i % bundle_size == 0 {
                member.labels.push(bundle_label);
            } else {
                let instance = member
                    .schedule_options
                    .affinity
                    .instance
                    .get_or_insert_with(SelectorSet::default);
                instance.required = Some(Selector::single(vec![LabelExpression::exists(
                    bundle_label,
                )]));
            }
            members.push(member);
        }
        members
    }

    /// Creates the group. On success the member instance ids land on the
    /// group's return object.
    pub async fn create(
        &self,
        function: FunctionMeta,
        args: Vec<Arg>,
        create_opts: InvokeOptions,
    ) -> Result<ObjRef, StratusError> {
        let mut spec = InvokeSpec::new(
            InvokeType::CreateGroup,
            function,
            args,
            create_opts,
            self.adaptor.retry_budget(),
        );
        spec.validate()?;
        let store = self.adaptor.store();
        let handle_id = store.generate_key("grp");
        store.add_return_object(&handle_id)?;
        spec.return_ids = vec![handle_id.clone()];
        store.bind_obj_ref_in_req(&spec.request_id, &spec.return_ids);

        let body = spec.build_create_request(self.adaptor.tenant_id());
        let requests = self.assemble_member_requests(&body);
        let frame = Frame::CreateGroup(CreateGroupRequest {
            request_id: spec.request_id.clone(),
            trace_id: spec.trace_id.clone(),
            tenant_id: self.adaptor.tenant_id().to_string(),
            group_options: GroupOptions {
                group_name: self.name.clone(),
                same_lifecycle: self.opts.same_lifecycle,
                timeout_ms: self.opts.timeout_ms,
                bundle_size: self.opts.bundle_size,
                total_size: self.opts.group_size,
                is_range: false,
            },
            requests,
            return_object_id: handle_id.clone(),
            parent_instance_id: None,
        });
        let spec = Arc::new(spec);
        self.adaptor.request_manager().push_request(spec.clone());
        match self.adaptor.send_with_ack(&spec.request_id, frame).await {
            Ok(Frame::CreateGroupResponse(resp)) if resp.status.is_ok() => {
                *self.group_id.lock() = Some(resp.group_id);
                *self.return_object_id.lock() = Some(handle_id.clone());
                Ok(ObjRef { id: handle_id })
            }
            Ok(Frame::CreateGroupResponse(resp)) => {
                self.adaptor.request_manager().remove_request(&spec.request_id);
                store.set_error(&handle_id, resp.status.clone());
                let bound = store.unbind_obj_ref_in_req(&spec.request_id);
                store.decrease_global_reference(&bound);
                Err(StratusError::GroupFailed {
                    group: self.name.clone(),
                    message: resp.status.message,
                })
            }
            Ok(other) => Err(StratusError::Internal(format!(
                "unexpected acknowledgement {other:?}"
            ))),
            Err(e) => {
                self.adaptor.request_manager().remove_request(&spec.request_id);
                store.set_error(&handle_id, Status::from(&e));
                Err(e)
            }
        }
    }

    /// Blocks until the group is running and returns its member ids.
    pub async fn wait_ready(&self, timeout_ms: i64) -> Result<Vec<String>, StratusError> {
        let Some(handle_id) = self.return_object_id.lock().clone() else {
            return Err(StratusError::GroupNotFound(self.name.clone()));
        };
        self.adaptor
            .store()
            .wait_instance_ids(&handle_id, timeout_ms)
            .await
            .map_err(|s| StratusError::GroupFailed {
                group: self.name.clone(),
                message: s.message,
            })
    }

    /// Fans one invocation out across every member, partitioning the
    /// original return ids evenly across the members.
    pub async fn invoke_all(
        &self,
        function: FunctionMeta,
        args: Vec<Arg>,
        returns_per_member: usize,
        opts: InvokeOptions,
    ) -> Result<Vec<ObjRef>, StratusError> {
        let instance_ids = self.wait_ready(self.opts.timeout_ms as i64).await?;
        if instance_ids.is_empty() {
            return Err(StratusError::GroupFailed {
                group: self.name.clone(),
                message: "group has no member instances".into(),
            });
        }
        debug!(
            "fan-out invoke across {} member(s) of group {}",
            instance_ids.len(),
            self.name
        );
        let mut all_refs = Vec::with_capacity(instance_ids.len() * returns_per_member);
        for instance_id in &instance_ids {
            let refs = self
                .adaptor
                .invoke_instance_id(
                    instance_id,
                    function.clone(),
                    args.clone(),
                    returns_per_member,
                    opts.clone(),
                )
                .await?;
            all_refs.extend(refs);
        }
        Ok(all_refs)
    }

    /// Sends the accelerate handshake to every member and returns the queue
    /// handles. The shared-memory pump itself is owned by the runtimes.
    pub async fn accelerate(&self) -> Result<Vec<String>, StratusError> {
        let instance_ids = self.wait_ready(self.opts.timeout_ms as i64).await?;
        let mut handles = Vec::with_capacity(instance_ids.len());
        for instance_id in &instance_ids {
            let handle = self
                .adaptor
                .kill(instance_id, signal::ACCELERATE, "")
                .await?;
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Kills the whole group.
    pub async fn terminate(&self) -> Status {
        let Some(group_id) = self.group_id.lock().clone() else {
            return Status::new(
                StatusCode::GroupScheduleFailed,
                format!("group {} was never created", self.name),
            );
        };
        let status = self.adaptor.kill_group(&group_id, "").await;
        if status.is_err() {
            warn!("terminate of group {} failed: {}", self.name, status.message);
        }
        status
    }
}

/// Creates a range group: one body request plus a group-options envelope;
/// the server fans the range out.
pub async fn range_create(
    adaptor: &Arc<InvokeAdaptor>,
    group_name: &str,
    total_size: usize,
    function: FunctionMeta,
    args: Vec<Arg>,
    create_opts: InvokeOptions,
    timeout_ms: u64,
    same_lifecycle: bool,
) -> Result<(String, ObjRef), StratusError> {
    let mut spec = InvokeSpec::new(
        InvokeType::CreateGroup,
        function,
        args,
        create_opts,
        adaptor.retry_budget(),
    );
    spec.validate()?;
    let store = adaptor.store();
    let handle_id = store.generate_key("grp");
    store.add_return_object(&handle_id)?;
    spec.return_ids = vec![handle_id.clone()];
    store.bind_obj_ref_in_req(&spec.request_id, &spec.return_ids);

    let body = spec.build_create_request(adaptor.tenant_id());
    let frame = Frame::CreateGroup(CreateGroupRequest {
        request_id: spec.request_id.clone(),
        trace_id: spec.trace_id.clone(),
        tenant_id: adaptor.tenant_id().to_string(),
        group_options: GroupOptions {
            group_name: group_name.to_string(),
            same_lifecycle,
            timeout_ms,
            bundle_size: 0,
            total_size,
            is_range: true,
        },
        requests: vec![body],
        return_object_id: handle_id.clone(),
        parent_instance_id: None,
    });
    let spec = Arc::new(spec);
    adaptor.request_manager().push_request(spec.clone());
    match adaptor.send_with_ack(&spec.request_id, frame).await {
        Ok(Frame::CreateGroupResponse(resp)) if resp.status.is_ok() => {
            Ok((resp.group_id, ObjRef { id: handle_id }))
        }
        Ok(Frame::CreateGroupResponse(resp)) => {
            adaptor.request_manager().remove_request(&spec.request_id);
            store.set_error(&handle_id, resp.status.clone());
            let bound = store.unbind_obj_ref_in_req(&spec.request_id);
            store.decrease_global_reference(&bound);
            Err(StratusError::GroupFailed {
                group: group_name.to_string(),
                message: resp.status.message,
            })
        }
        Ok(other) => Err(StratusError::Internal(format!(
            "unexpected acknowledgement {other:?}"
        ))),
        Err(e) => {
            adaptor.request_manager().remove_request(&spec.request_id);
            store.set_error(&handle_id, Status::from(&e));
            Err(e)
        }
    }
}
