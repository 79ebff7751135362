// src/client/spec.rs

//! The invoke spec: one submitted request with its locally computed fields
//! (return object ids, sequence numbers, retry budget) and the request
//! builders the adaptor sends on the wire.

use crate::core::errors::StratusError;
use crate::core::instances::ScheduleOptions;
use crate::core::protocol::{Arg, CreateRequest, InvokeRequest};
use crate::core::resources::{Affinity, Resources};
use crate::core::validate;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeType {
    CreateInstance,
    InvokeFunction,
    CreateGroup,
    GetNamedInstance,
}

/// Identifies the user function being created or invoked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionMeta {
    pub name: String,
    pub namespace: Option<String>,
    pub urn: String,
}

impl FunctionMeta {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        FunctionMeta {
            urn: name.clone(),
            name,
            namespace: None,
        }
    }
}

/// Per-call knobs a user hands to the adaptor.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub priority: u16,
    pub need_order: bool,
    pub concurrency: u32,
    pub labels: Vec<String>,
    pub affinity: Affinity,
    pub resources: Resources,
    pub schedule_timeout_ms: u64,
    pub preempted_allowed: bool,
    pub named_instance: Option<String>,
    pub resource_group: Option<String>,
    /// Set on the get-named-instance path so ordering registers lazily.
    pub is_get_instance: bool,
    /// Overrides the configured retry budget when set.
    pub max_retries: Option<u32>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        InvokeOptions {
            priority: 0,
            need_order: false,
            concurrency: 1,
            labels: Vec::new(),
            affinity: Affinity::default(),
            resources: Resources::default(),
            schedule_timeout_ms: 0,
            preempted_allowed: false,
            named_instance: None,
            resource_group: None,
            is_get_instance: false,
            max_retries: None,
        }
    }
}

/// One tracked request. Specs are immutable once pushed; a retry clones the
/// spec with one retry slot consumed.
#[derive(Debug, Clone)]
pub struct InvokeSpec {
    pub request_id: String,
    pub trace_id: String,
    pub invoke_type: InvokeType,
    pub function: FunctionMeta,
    pub args: Vec<Arg>,
    pub return_ids: Vec<String>,
    /// The target instance for invokes; empty for creates.
    pub instance_id: String,
    /// The id the invoke-order manager keys on when it differs from the
    /// target instance id (ordered invokes through a create handle).
    pub ordering_key: Option<String>,
    pub opts: InvokeOptions,
    pub invoke_seq: u64,
    pub unfinished_seq: u64,
    pub remaining_retries: u32,
}

impl InvokeSpec {
    pub fn new(
        invoke_type: InvokeType,
        function: FunctionMeta,
        args: Vec<Arg>,
        opts: InvokeOptions,
        retry_budget: u32,
    ) -> Self {
        InvokeSpec {
            request_id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().to_string(),
            invoke_type,
            function,
            args,
            return_ids: Vec::new(),
            instance_id: String::new(),
            ordering_key: None,
            opts: opts.clone(),
            invoke_seq: 0,
            unfinished_seq: 0,
            remaining_retries: opts.max_retries.unwrap_or(retry_budget),
        }
    }

    /// Synchronous validation; invalid input fails before anything leaves
    /// the process.
    pub fn validate(&self) -> Result<(), StratusError> {
        validate::validate_function_name(&self.function.name)?;
        validate::validate_labels(&self.opts.labels)?;
        validate::validate_concurrency(self.opts.concurrency)?;
        if let Some(name) = &self.opts.named_instance {
            validate::validate_label(name)?;
        }
        Ok(())
    }

    /// The id the invoke-order manager keys this spec's ordering on: the
    /// explicit ordering key, the named instance, the target instance, or
    /// the create's handle object.
    pub fn ordering_instance_id(&self) -> String {
        if let Some(key) = &self.ordering_key {
            return key.clone();
        }
        if let Some(name) = &self.opts.named_instance {
            return name.clone();
        }
        if !self.instance_id.is_empty() {
            return self.instance_id.clone();
        }
        self.return_ids.first().cloned().unwrap_or_default()
    }

    /// A retry clone with one retry slot consumed and a fresh trace id.
    pub fn retry_clone(&self) -> InvokeSpec {
        let mut spec = self.clone();
        spec.remaining_retries = spec.remaining_retries.saturating_sub(1);
        spec.trace_id = Uuid::new_v4().to_string();
        spec
    }

    fn schedule_options(&self) -> ScheduleOptions {
        ScheduleOptions {
            priority: self.opts.priority,
            preempted_allowed: self.opts.preempted_allowed,
            affinity: self.opts.affinity.clone(),
            schedule_timeout_ms: self.opts.schedule_timeout_ms,
            resource_group: self.opts.resource_group.clone(),
        }
    }

    pub fn build_create_request(&self, tenant_id: &str) -> CreateRequest {
        CreateRequest {
            request_id: self.request_id.clone(),
            trace_id: self.trace_id.clone(),
            tenant_id: tenant_id.to_string(),
            function_urn: self.function.urn.clone(),
            args: self.args.clone(),
            return_object_ids: self.return_ids.clone(),
            labels: self.opts.labels.clone(),
            resources: self.opts.resources.clone(),
            schedule_options: self.schedule_options(),
            concurrency: self.opts.concurrency,
            named_instance: self.opts.named_instance.clone(),
            group_id: None,
            parent_instance_id: None,
        }
    }

    pub fn build_invoke_request(&self) -> InvokeRequest {
        InvokeRequest {
            request_id: self.request_id.clone(),
            trace_id: self.trace_id.clone(),
            instance_id: self.instance_id.clone(),
            function_urn: self.function.urn.clone(),
            args: self.args.clone(),
            return_object_ids: self.return_ids.clone(),
            invoke_seq: self.invoke_seq,
            unfinished_seq: self.unfinished_seq,
            need_order: self.opts.need_order,
        }
    }
}
