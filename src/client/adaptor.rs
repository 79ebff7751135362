// src/client/adaptor.rs

//! The invoke adaptor: the user-facing create/invoke/kill/cancel API. It
//! builds request specs, registers return objects before anything leaves
//! the process, correlates notifications back to waiters, and retries
//! transient failures within a configured budget.

use super::notify::{self, HandlerRegistry};
use super::request::RequestManager;
use super::spec::{FunctionMeta, InvokeOptions, InvokeSpec, InvokeType};
use crate::config::ClientConfig;
use crate::core::errors::{Status, StatusCode, StratusError};
use crate::core::objects::{ObjectStore, WaitResult};
use crate::core::ordering::InvokeOrderManager;
use crate::core::instances::InstanceInfo;
use crate::core::protocol::{Arg, CancelRequest, Frame, FrameCodec, KillRequest, NotifyRequest};
use crate::core::resources::ResourceUnit;
use crate::core::signal;
use bytes::Bytes;
use dashmap::DashMap;
use futures::SinkExt;
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// How long a submission waits for its acknowledgement frame.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// A handle to a future value: the stable object id a `get`/`wait` resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjRef {
    pub id: String,
}

type Writer = FramedWrite<OwnedWriteHalf, FrameCodec>;

pub struct InvokeAdaptor {
    config: ClientConfig,
    tenant_id: String,
    addr: String,
    store: Arc<ObjectStore>,
    order_mgr: Arc<InvokeOrderManager>,
    requests: Arc<RequestManager>,
    acks: Arc<DashMap<String, oneshot::Sender<Frame>>>,
    writer: Mutex<Option<Writer>>,
    owned_instances: SyncMutex<HashSet<String>>,
    is_running: AtomicBool,
    handlers: Arc<HandlerRegistry>,
    notify_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl InvokeAdaptor {
    /// Connects to the control plane and starts the notification bus.
    pub async fn connect(
        addr: &str,
        tenant_id: &str,
        config: ClientConfig,
        store: Arc<ObjectStore>,
        order_mgr: Arc<InvokeOrderManager>,
    ) -> Result<Arc<Self>, StratusError> {
        let adaptor = Arc::new(InvokeAdaptor {
            config,
            tenant_id: tenant_id.to_string(),
            addr: addr.to_string(),
            store,
            order_mgr,
            requests: Arc::new(RequestManager::new()),
            acks: Arc::new(DashMap::new()),
            writer: Mutex::new(None),
            owned_instances: SyncMutex::new(HashSet::new()),
            is_running: AtomicBool::new(true),
            handlers: Arc::new(HandlerRegistry::new()),
            notify_task: SyncMutex::new(None),
        });
        adaptor.reconnect().await?;
        Ok(adaptor)
    }

    pub fn store(&self) -> Arc<ObjectStore> {
        self.store.clone()
    }

    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.handlers.clone()
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn retry_budget(&self) -> u32 {
        self.config.max_retries
    }

    pub fn request_manager(&self) -> Arc<RequestManager> {
        self.requests.clone()
    }

    /// (Re-)establishes the connection and restarts the receive loop.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), StratusError> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.addr),
        )
        .await
        .map_err(|_| {
            StratusError::RequestTimeout(format!("connect to {} timed out", self.addr))
        })??;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(FramedWrite::new(write_half, FrameCodec::new()));
        let reader = FramedRead::new(read_half, FrameCodec::new());
        let task = notify::spawn_receive_loop(self.clone(), reader);
        if let Some(old) = self.notify_task.lock().replace(task) {
            old.abort();
        }
        info!("connected to control plane at {}", self.addr);
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), StratusError> {
        if self.is_running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StratusError::Finalized)
        }
    }

    // ---- wire helpers ------------------------------------------------------

    /// Writes one frame; failures surface as the retryable bus error.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), StratusError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(StratusError::RuntimeBus("not connected".into()));
        };
        writer
            .send(frame)
            .await
            .map_err(|e| StratusError::RuntimeBus(e.to_string()))
    }

    /// Sends a request and awaits its acknowledgement frame.
    pub async fn send_with_ack(
        &self,
        request_id: &str,
        frame: Frame,
    ) -> Result<Frame, StratusError> {
        let (tx, rx) = oneshot::channel();
        self.acks.insert(request_id.to_string(), tx);
        if let Err(e) = self.send_frame(frame).await {
            self.acks.remove(request_id);
            return Err(e);
        }
        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => {
                self.acks.remove(request_id);
                Err(StratusError::RuntimeBus(
                    "acknowledgement channel dropped".into(),
                ))
            }
            Err(_) => {
                self.acks.remove(request_id);
                Err(StratusError::RequestTimeout(format!(
                    "no acknowledgement for request {request_id}"
                )))
            }
        }
    }

    /// Routes one inbound frame. Returns false to stop the receive loop.
    pub async fn dispatch_inbound(self: &Arc<Self>, frame: Frame) -> bool {
        if let Some(request_id) = frame.ack_request_id().map(|s| s.to_string()) {
            if let Some((_, tx)) = self.acks.remove(&request_id) {
                let _ = tx.send(frame);
            } else {
                debug!("acknowledgement for unknown request {}", request_id);
            }
            return true;
        }
        match frame {
            Frame::Notify(notify) => {
                self.handle_notify(notify).await;
            }
            Frame::Signal(req) => self.handlers.on_signal(req),
            Frame::Checkpoint(req) => self.handlers.on_checkpoint(req),
            Frame::Recover(req) => self.handlers.on_recover(req),
            Frame::Shutdown(req) => self.handlers.on_shutdown(req),
            other => {
                warn!("unexpected frame on notification bus: {:?}", other);
            }
        }
        self.is_running.load(Ordering::SeqCst)
    }

    /// Called by the receive loop when the transport drops.
    pub fn on_transport_closed(&self) {
        if self.is_running.load(Ordering::SeqCst) {
            warn!("connection to {} lost", self.addr);
        }
    }

    // ---- create / invoke ---------------------------------------------------

    /// Creates a stateful instance; the returned handle's object becomes
    /// ready once the instance is running, carrying its instance id.
    pub async fn create_instance(
        self: &Arc<Self>,
        function: FunctionMeta,
        args: Vec<Arg>,
        opts: InvokeOptions,
    ) -> Result<ObjRef, StratusError> {
        self.ensure_running()?;
        let mut spec = InvokeSpec::new(
            InvokeType::CreateInstance,
            function,
            args,
            opts,
            self.config.max_retries,
        );
        spec.validate()?;
        let handle_id = self.store.generate_key("ins");
        self.store.add_return_object(&handle_id)?;
        spec.return_ids = vec![handle_id.clone()];
        self.store
            .bind_obj_ref_in_req(&spec.request_id, &spec.return_ids);
        if spec.opts.need_order {
            if let Some(seq) = self.order_mgr.create_instance(&spec.ordering_instance_id()) {
                spec.invoke_seq = seq;
            }
        }
        let spec = Arc::new(spec);
        self.requests.push_request(spec.clone());
        let frame = Frame::Create(spec.build_create_request(&self.tenant_id));
        match self.send_with_ack(&spec.request_id, frame).await {
            Ok(Frame::CreateResponse(resp)) if resp.status.is_ok() => Ok(ObjRef { id: handle_id }),
            Ok(Frame::CreateResponse(resp)) => {
                self.abort_spec(&spec, resp.status.clone());
                Err(StratusError::Parameter(resp.status.message))
            }
            Ok(other) => {
                let status = Status::new(
                    StatusCode::InnerSystemError,
                    format!("unexpected acknowledgement {other:?}"),
                );
                self.abort_spec(&spec, status.clone());
                Err(StratusError::Internal(status.message))
            }
            Err(e) => {
                self.abort_spec(&spec, Status::from(&e));
                Err(e)
            }
        }
    }

    /// Invokes a function on an instance identified by its create handle.
    pub async fn invoke_function(
        self: &Arc<Self>,
        instance: &ObjRef,
        function: FunctionMeta,
        args: Vec<Arg>,
        num_returns: usize,
        opts: InvokeOptions,
    ) -> Result<Vec<ObjRef>, StratusError> {
        self.ensure_running()?;
        let instance_ids = self
            .store
            .wait_instance_ids(&instance.id, self.wait_timeout_ms(&opts))
            .await
            .map_err(|s| StratusError::InstanceNotFound(s.message))?;
        let Some(instance_id) = instance_ids.first().cloned() else {
            return Err(StratusError::InstanceNotFound(instance.id.clone()));
        };
        // Ordering was registered under the handle at create time, so the
        // invoke keys on the handle as well.
        self.invoke_with_ordering(
            &instance_id,
            Some(instance.id.clone()),
            function,
            args,
            num_returns,
            opts,
        )
        .await
    }

    /// Invokes directly on a known instance id (group fan-out, named
    /// instances).
    pub async fn invoke_instance_id(
        self: &Arc<Self>,
        instance_id: &str,
        function: FunctionMeta,
        args: Vec<Arg>,
        num_returns: usize,
        opts: InvokeOptions,
    ) -> Result<Vec<ObjRef>, StratusError> {
        self.invoke_with_ordering(instance_id, None, function, args, num_returns, opts)
            .await
    }

    async fn invoke_with_ordering(
        self: &Arc<Self>,
        instance_id: &str,
        ordering_key: Option<String>,
        function: FunctionMeta,
        args: Vec<Arg>,
        num_returns: usize,
        opts: InvokeOptions,
    ) -> Result<Vec<ObjRef>, StratusError> {
        self.ensure_running()?;
        let mut spec = InvokeSpec::new(
            InvokeType::InvokeFunction,
            function,
            args,
            opts,
            self.config.max_retries,
        );
        spec.validate()?;
        spec.instance_id = instance_id.to_string();
        spec.ordering_key = ordering_key;
        let mut refs = Vec::with_capacity(num_returns);
        for _ in 0..num_returns.max(1) {
            let id = self.store.generate_key("obj");
            self.store.add_return_object(&id)?;
            refs.push(ObjRef { id });
        }
        spec.return_ids = refs.iter().map(|r| r.id.clone()).collect();
        self.store
            .bind_obj_ref_in_req(&spec.request_id, &spec.return_ids);
        if spec.opts.need_order {
            let ordering_id = spec.ordering_instance_id();
            if let Some(seq) = self
                .order_mgr
                .assign_seq(&ordering_id, spec.opts.is_get_instance)
            {
                spec.invoke_seq = seq;
            }
            if let Some(unfinished) = self.order_mgr.unfinished_seq(&ordering_id) {
                spec.unfinished_seq = unfinished;
            }
        }
        let spec = Arc::new(spec);
        self.requests.push_request(spec.clone());
        let frame = Frame::Invoke(spec.build_invoke_request());
        match self.send_with_ack(&spec.request_id, frame).await {
            Ok(Frame::InvokeResponse(resp)) if resp.status.is_ok() => Ok(refs),
            Ok(Frame::InvokeResponse(resp)) => {
                self.abort_spec(&spec, resp.status.clone());
                Err(StratusError::InstanceNotFound(resp.status.message))
            }
            Ok(other) => {
                let status = Status::new(
                    StatusCode::InnerSystemError,
                    format!("unexpected acknowledgement {other:?}"),
                );
                self.abort_spec(&spec, status.clone());
                Err(StratusError::Internal(status.message))
            }
            Err(e) => {
                self.abort_spec(&spec, Status::from(&e));
                Err(e)
            }
        }
    }

    fn wait_timeout_ms(&self, opts: &InvokeOptions) -> i64 {
        if opts.schedule_timeout_ms == 0 {
            30_000
        } else {
            opts.schedule_timeout_ms as i64
        }
    }

    /// Drops a spec that never reached the server.
    fn abort_spec(&self, spec: &Arc<InvokeSpec>, status: Status) {
        self.requests.remove_request(&spec.request_id);
        self.fail_spec(spec, status);
    }

    /// Fails a spec's return objects and releases its request-scoped refs.
    fn fail_spec(&self, spec: &Arc<InvokeSpec>, status: Status) {
        for id in &spec.return_ids {
            self.store.set_error(id, status.clone());
        }
        let bound = self.store.unbind_obj_ref_in_req(&spec.request_id);
        if !bound.is_empty() {
            self.store.decrease_global_reference(&bound);
        }
        if spec.opts.need_order && spec.invoke_type == InvokeType::CreateInstance {
            self.order_mgr.remove_instance(&spec.ordering_instance_id());
        }
    }

    // ---- notification handling --------------------------------------------

    /// Correlates one completion notification to its spec and settles the
    /// return objects, retrying transient failures within the budget.
    pub async fn handle_notify(self: &Arc<Self>, notify: NotifyRequest) {
        let Some(spec) = self.requests.get_request(&notify.request_id) else {
            debug!("notify for unknown request {}", notify.request_id);
            return;
        };
        let code = notify.code();
        if notify.is_success() {
            self.requests.remove_request(&notify.request_id);
            self.complete_spec(&spec, &notify).await;
            return;
        }
        if code.is_retryable() && spec.remaining_retries > 0 {
            warn!(
                "{}|retryable failure ({}): {} retries left",
                spec.request_id,
                code,
                spec.remaining_retries
            );
            self.requests.remove_request(&notify.request_id);
            let retry = Arc::new(spec.retry_clone());
            let adaptor = self.clone();
            tokio::spawn(async move {
                adaptor.resubmit(retry).await;
            });
            return;
        }
        self.requests.remove_request(&notify.request_id);
        self.fail_spec(&spec, Status::new(code, notify.message.clone()));
    }

    async fn complete_spec(self: &Arc<Self>, spec: &Arc<InvokeSpec>, notify: &NotifyRequest) {
        match spec.invoke_type {
            InvokeType::CreateInstance | InvokeType::CreateGroup => {
                if let Some(handle_id) = spec.return_ids.first() {
                    self.store
                        .set_instance_ids(handle_id, notify.instance_ids.clone());
                    self.store.set_ready(handle_id);
                }
                let mut owned = self.owned_instances.lock();
                for id in &notify.instance_ids {
                    owned.insert(id.clone());
                }
            }
            InvokeType::InvokeFunction | InvokeType::GetNamedInstance => {
                for result in &notify.results {
                    if let Some(payload) = &result.payload {
                        if let Err(e) = self
                            .store
                            .put(&result.object_id, payload.clone(), HashSet::new(), false)
                            .await
                        {
                            error!(
                                "failed to store result payload for {}: {}",
                                result.object_id, e
                            );
                        }
                    }
                    self.store.set_ready(&result.object_id);
                }
            }
        }
        if spec.opts.need_order {
            self.order_mgr
                .notify_invoke_success(&spec.ordering_instance_id(), spec.invoke_seq);
        }
        debug!("{}|request completed", spec.request_id);
    }

    /// Replays a retryable spec after a backoff with jitter; the connection
    /// is re-established first, mirroring a reset between attempts.
    fn resubmit<'a>(
        self: &'a Arc<Self>,
        spec: Arc<InvokeSpec>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.resubmit_inner(spec))
    }

    async fn resubmit_inner(self: &Arc<Self>, spec: Arc<InvokeSpec>) {
        let jitter = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(0..=50))
        };
        tokio::time::sleep(self.config.retry_backoff + jitter).await;
        if self.ensure_running().is_err() {
            self.fail_spec(&spec, Status::new(StatusCode::Finalized, "runtime finalized"));
            return;
        }
        if self.reconnect().await.is_err() {
            warn!("{}|reconnect before retry failed", spec.request_id);
        }
        let frame = match spec.invoke_type {
            InvokeType::CreateInstance => Frame::Create(spec.build_create_request(&self.tenant_id)),
            InvokeType::InvokeFunction | InvokeType::GetNamedInstance => {
                Frame::Invoke(spec.build_invoke_request())
            }
            InvokeType::CreateGroup => {
                // Group bodies are rebuilt by the group layer; a bare spec
                // cannot be replayed.
                self.fail_spec(
                    &spec,
                    Status::new(StatusCode::InnerSystemError, "group create not retryable"),
                );
                return;
            }
        };
        self.requests.push_request(spec.clone());
        match self.send_with_ack(&spec.request_id, frame).await {
            Ok(_) => {
                info!(
                    "{}|resubmitted, {} retries left",
                    spec.request_id, spec.remaining_retries
                );
            }
            Err(e) => {
                self.requests.remove_request(&spec.request_id);
                if spec.remaining_retries > 0 {
                    let retry = Arc::new(spec.retry_clone());
                    let adaptor = self.clone();
                    tokio::spawn(async move {
                        adaptor.resubmit(retry).await;
                    });
                } else {
                    self.fail_spec(&spec, Status::from(&e));
                }
            }
        }
    }

    // ---- kill / cancel / queries -------------------------------------------

    pub async fn kill(
        &self,
        instance_id: &str,
        sig: i32,
        payload: &str,
    ) -> Result<String, StratusError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::Kill(KillRequest {
            request_id: request_id.clone(),
            instance_id: instance_id.to_string(),
            signal: sig,
            payload: payload.to_string(),
        });
        match self.send_with_ack(&request_id, frame).await? {
            Frame::KillResponse(resp) if resp.status.is_ok() => {
                self.order_mgr.clear_on_signal(instance_id, sig);
                self.owned_instances.lock().remove(instance_id);
                Ok(resp.message)
            }
            Frame::KillResponse(resp) => Err(StratusError::InstanceNotFound(resp.status.message)),
            other => Err(StratusError::Internal(format!(
                "unexpected acknowledgement {other:?}"
            ))),
        }
    }

    /// Fire-and-forget kill.
    pub fn kill_async(self: &Arc<Self>, instance_id: &str, sig: i32, payload: &str) {
        let adaptor = self.clone();
        let instance_id = instance_id.to_string();
        let payload = payload.to_string();
        tokio::spawn(async move {
            if let Err(e) = adaptor.kill(&instance_id, sig, &payload).await {
                warn!("async kill of {} failed: {}", instance_id, e);
            }
        });
    }

    /// Cancels the in-flight requests producing the given objects.
    pub async fn cancel(
        &self,
        object_ids: &[String],
        is_force: bool,
        is_recursive: bool,
    ) -> Result<(), StratusError> {
        let mut target_request_ids = Vec::new();
        for object_id in object_ids {
            if let Some(spec) = self.requests.find_by_return_id(object_id) {
                target_request_ids.push(spec.request_id.clone());
            }
        }
        if target_request_ids.is_empty() {
            return Ok(());
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::Cancel(CancelRequest {
            request_id: request_id.clone(),
            target_request_ids,
            is_force,
            is_recursive,
        });
        match self.send_with_ack(&request_id, frame).await? {
            Frame::CancelResponse(_) => Ok(()),
            other => Err(StratusError::Internal(format!(
                "unexpected acknowledgement {other:?}"
            ))),
        }
    }

    pub async fn kill_group(&self, group_id: &str, src_instance_id: &str) -> Status {
        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::KillGroup(crate::core::protocol::KillGroupRequest {
            request_id: request_id.clone(),
            group_id: group_id.to_string(),
            src_instance_id: src_instance_id.to_string(),
        });
        match self.send_with_ack(&request_id, frame).await {
            Ok(Frame::KillGroupResponse(resp)) => resp.status,
            Ok(other) => Status::new(
                StatusCode::InnerSystemError,
                format!("unexpected acknowledgement {other:?}"),
            ),
            Err(e) => Status::from(&e),
        }
    }

    pub async fn get_resources(&self) -> Result<Vec<ResourceUnit>, StratusError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        match self
            .send_with_ack(
                &request_id,
                Frame::QueryResources {
                    request_id: request_id.clone(),
                },
            )
            .await?
        {
            Frame::QueryResourcesResponse { units, .. } => Ok(units),
            other => Err(StratusError::Internal(format!(
                "unexpected acknowledgement {other:?}"
            ))),
        }
    }

    pub async fn query_named_instances(&self) -> Result<Vec<InstanceInfo>, StratusError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        match self
            .send_with_ack(
                &request_id,
                Frame::QueryNamedInstances {
                    request_id: request_id.clone(),
                },
            )
            .await?
        {
            Frame::QueryNamedInstancesResponse { instances, .. } => Ok(instances),
            other => Err(StratusError::Internal(format!(
                "unexpected acknowledgement {other:?}"
            ))),
        }
    }

    pub async fn heartbeat(&self, instance_id: &str) -> Result<(), StratusError> {
        self.send_frame(Frame::Heartbeat {
            instance_id: instance_id.to_string(),
        })
        .await
    }

    // ---- object helpers ----------------------------------------------------

    pub async fn get(&self, obj: &ObjRef, timeout_ms: i64) -> Result<Bytes, Status> {
        self.store.get(&obj.id, timeout_ms).await
    }

    pub async fn wait(
        &self,
        refs: &[ObjRef],
        min_ready: usize,
        timeout_ms: i64,
    ) -> WaitResult {
        let ids: Vec<String> = refs.iter().map(|r| r.id.clone()).collect();
        self.store.wait(&ids, min_ready, timeout_ms).await
    }

    // ---- shutdown ----------------------------------------------------------

    /// Kills every owned instance, drains outstanding waiters with a
    /// FINALIZED error, and closes the channel.
    pub async fn finalize(self: &Arc<Self>) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("finalizing invoke adaptor");
        let owned: Vec<String> = self.owned_instances.lock().drain().collect();
        for instance_id in owned {
            if let Err(e) = self
                .kill(&instance_id, signal::SHUT_DOWN_SIGNAL, "finalize")
                .await
            {
                warn!("finalize kill of {} failed: {}", instance_id, e);
            }
        }
        let finalized = Status::new(StatusCode::Finalized, "runtime finalized");
        for spec in self.requests.drain() {
            self.fail_spec(&spec, finalized.clone());
        }
        self.store.wait_manager().clear(&finalized);
        let _ = self.send_frame(Frame::Exit).await;
        *self.writer.lock().await = None;
        if let Some(task) = self.notify_task.lock().take() {
            task.abort();
        }
    }
}
