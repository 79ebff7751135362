// src/core/state.rs

//! Defines the central `ServerState` struct, holding all shared
//! control-plane state, and the channel bundle the task spawner consumes.

use crate::config::Config;
use crate::core::errors::StratusError;
use crate::core::groups::{GroupManagerActor, GroupManagerHandle, Role, ScheduleControl};
use crate::core::instances::InstanceRegistry;
use crate::core::meta::{GetOptions, MemoryMetaStore, MetaStore, INSTANCE_PATH_PREFIX};
use crate::core::router::{LoopbackRouter, NodeRouter};
use crate::core::protocol::Frame;
use crate::core::resources::view::ResourceView;
use crate::core::resources::ResourceUnit;
use crate::core::rgroup::ResourceGroupRegistry;
use crate::core::scheduler::{QueueItem, ScheduleRecorder};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, reload};

/// Key prefix for persisted resource units.
pub const UNIT_PATH_PREFIX: &str = "/sn/unit/";

const SCHEDULER_MAILBOX_CAPACITY: usize = 4096;

/// The scheduler actor's mailbox protocol.
pub enum SchedulerMsg {
    Enqueue(QueueItem),
    Cancel { id: String, reason: String },
    /// Snapshot the resource view, activate pending, drain running.
    Tick,
}

/// Routes group-kill cancellations into the scheduler actor.
pub struct SchedulerCancelControl {
    tx: mpsc::Sender<SchedulerMsg>,
}

impl ScheduleControl for SchedulerCancelControl {
    fn try_cancel(&self, id: &str, reason: &str) {
        let _ = self.tx.try_send(SchedulerMsg::Cancel {
            id: id.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Contains all initialized components required to spawn the server's
/// background tasks. Created once during initialization and consumed by the
/// spawner.
pub struct ServerInit {
    pub state: Arc<ServerState>,
    /// The scheduler actor's mailbox.
    pub scheduler_rx: mpsc::Receiver<SchedulerMsg>,
    /// Fan-out used to stop every background task on shutdown.
    pub shutdown_tx: broadcast::Sender<()>,
}

/// The central struct holding all shared control-plane state. Wrapped in an
/// `Arc` and passed to nearly every task and connection handler.
pub struct ServerState {
    /// Runtime configuration; mutable for dynamic knobs.
    pub config: Arc<Mutex<Config>>,
    /// Unique id of this control-plane incarnation.
    pub run_id: String,
    /// The authoritative cluster resource view.
    pub view: Arc<ResourceView>,
    /// Every instance the control plane knows about.
    pub registry: Arc<InstanceRegistry>,
    /// The metadata store, the single serialization point.
    pub meta: Arc<dyn MetaStore>,
    /// Outbound control traffic to worker nodes.
    pub router: Arc<dyn NodeRouter>,
    /// Last schedule error per request id.
    pub recorder: Arc<ScheduleRecorder>,
    /// Named slices of the resource view.
    pub rgroups: Arc<ResourceGroupRegistry>,
    /// The group manager actor's handle.
    pub group_manager: GroupManagerHandle,
    /// The scheduler actor's mailbox sender.
    pub scheduler_tx: mpsc::Sender<SchedulerMsg>,
    /// Connected client sessions, keyed by session id, each with a sender
    /// for asynchronous pushes (Notify and friends).
    pub clients: DashMap<u64, mpsc::Sender<Frame>>,
    pub next_session_id: AtomicU64,
    pub is_shutting_down: AtomicBool,
    /// Handle to the logging filter for dynamic log level changes.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}

impl ServerState {
    /// Initializes the entire control-plane state. This is the main factory
    /// function for the server's shared context.
    pub async fn initialize(
        config: Config,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
        meta: Arc<dyn MetaStore>,
        router: Arc<dyn NodeRouter>,
    ) -> Result<ServerInit, StratusError> {
        // A unique run id for this incarnation, used in traces.
        let mut run_id_bytes = [0u8; 20];
        getrandom::fill(&mut run_id_bytes)
            .map_err(|e| StratusError::Internal(e.to_string()))?;
        let run_id = hex::encode(run_id_bytes);

        let (scheduler_tx, scheduler_rx) = mpsc::channel(SCHEDULER_MAILBOX_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let registry = Arc::new(InstanceRegistry::new());
        let group_manager = GroupManagerActor::spawn(
            meta.clone(),
            router.clone(),
            Arc::new(SchedulerCancelControl {
                tx: scheduler_tx.clone(),
            }),
            registry.clone(),
            config.groups.kill_timeout,
        )
        .await?;
        // Single-process deployments have no contender; this incarnation
        // is the master from the start.
        group_manager.role_change(Role::Master).await;

        let state = Arc::new(ServerState {
            config: Arc::new(Mutex::new(config)),
            run_id,
            view: Arc::new(ResourceView::new()),
            registry,
            meta,
            router,
            recorder: Arc::new(ScheduleRecorder::new()),
            rgroups: Arc::new(ResourceGroupRegistry::new()),
            group_manager,
            scheduler_tx,
            clients: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            is_shutting_down: AtomicBool::new(false),
            log_reload_handle,
        });
        state.recover().await?;

        Ok(ServerInit {
            state,
            scheduler_rx,
            shutdown_tx,
        })
    }

    /// Convenience constructor for tests and embedded use: in-memory meta
    /// store and a loopback router.
    pub async fn initialize_default(
        config: Config,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<ServerInit, StratusError> {
        ServerState::initialize(
            config,
            log_reload_handle,
            Arc::new(MemoryMetaStore::new()),
            Arc::new(LoopbackRouter),
        )
        .await
    }

    /// Recovery: the scheduler's transient queues are not persisted, so the
    /// durable state (units and instances) is re-read from the metadata
    /// store and the in-memory views rebuilt.
    async fn recover(&self) -> Result<(), StratusError> {
        let units = self
            .meta
            .get(
                UNIT_PATH_PREFIX,
                GetOptions {
                    prefix: true,
                    limit: 0,
                },
            )
            .await?;
        for kv in &units.kvs {
            match serde_json::from_str::<ResourceUnit>(&kv.value) {
                Ok(unit) => self.view.add_unit(unit),
                Err(e) => error!("failed to parse resource unit at {}: {}", kv.key, e),
            }
        }
        let instances = self
            .meta
            .get(
                INSTANCE_PATH_PREFIX,
                GetOptions {
                    prefix: true,
                    limit: 0,
                },
            )
            .await?;
        for kv in &instances.kvs {
            match serde_json::from_str::<crate::core::instances::InstanceInfo>(&kv.value) {
                Ok(info) => self.registry.upsert(info),
                Err(e) => error!("failed to parse instance info at {}: {}", kv.key, e),
            }
        }
        if !units.kvs.is_empty() || !instances.kvs.is_empty() {
            info!(
                "recovered {} resource unit(s) and {} instance(s) from the metadata store",
                units.kvs.len(),
                instances.kvs.len()
            );
        }
        Ok(())
    }

    /// Registers a resource unit, persisting it for recovery.
    pub async fn add_resource_unit(&self, unit: ResourceUnit) -> Result<(), StratusError> {
        let key = format!("{UNIT_PATH_PREFIX}{}", unit.unit_id);
        let value = serde_json::to_string(&unit)?;
        self.meta.put(&key, &value, None).await?;
        self.view.add_unit(unit);
        Ok(())
    }

    /// Removes a resource unit and its persisted record.
    pub async fn remove_resource_unit(&self, unit_id: &str) -> Result<(), StratusError> {
        self.meta
            .delete(&format!("{UNIT_PATH_PREFIX}{unit_id}"))
            .await?;
        self.view.remove_unit(unit_id);
        Ok(())
    }

    pub fn allocate_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Pushes an asynchronous frame to a connected client session.
    pub async fn push_to_client(&self, session_id: u64, frame: Frame) {
        let Some(tx) = self.clients.get(&session_id).map(|e| e.value().clone()) else {
            return;
        };
        if tx.send(frame).await.is_err() {
            self.clients.remove(&session_id);
        }
    }
}
