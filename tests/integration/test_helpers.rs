// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests.

use std::sync::Arc;
use std::time::Duration;
use stratus::config::Config;
use stratus::core::instances::{InstanceInfo, InstanceState, ScheduleOptions};
use stratus::core::resources::{Affinity, LabelSet, ResourceUnit, Resources};
use stratus::core::state::{ServerInit, ServerState};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

/// TestContext provides a complete in-process control plane: shared state,
/// the scheduler actor, the heartbeat monitor, and the group manager.
pub struct TestContext {
    pub state: Arc<ServerState>,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl TestContext {
    /// Creates a new test context with default configuration.
    pub async fn new() -> Self {
        let mut config = Config::default();
        // Tight timings keep the tests fast.
        config.scheduler.tick_interval = Duration::from_millis(20);
        config.heartbeat.sub_health_after = Duration::from_millis(100);
        config.heartbeat.fatal_after = Duration::from_millis(400);
        config.heartbeat.sweep_interval = Duration::from_millis(50);
        Self::with_config(config).await
    }

    /// Creates a new test context with custom configuration.
    pub async fn with_config(config: Config) -> Self {
        let env_filter = EnvFilter::new("warn");
        let (filter, reload_handle) = reload::Layer::new(env_filter);

        // Initialize tracing (ignore error if already initialized).
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();

        let reload_handle = Arc::new(reload_handle);

        let ServerInit {
            state,
            scheduler_rx,
            shutdown_tx,
        } = ServerState::initialize_default(config, reload_handle)
            .await
            .expect("failed to initialize server state");

        stratus::server::spawner::spawn_background_tasks(
            state.clone(),
            scheduler_rx,
            &shutdown_tx,
        )
        .await;

        Self { state, shutdown_tx }
    }

    /// Registers a unit with the given scalar capacity.
    pub async fn add_unit(&self, unit_id: &str, cpu: u64, memory: u64) {
        self.add_labeled_unit(unit_id, cpu, memory, &[]).await;
    }

    /// Registers a unit carrying static base labels.
    pub async fn add_labeled_unit(&self, unit_id: &str, cpu: u64, memory: u64, labels: &[&str]) {
        let unit = ResourceUnit::new(unit_id, format!("node-{unit_id}"), Resources::new(cpu, memory))
            .with_base_labels(LabelSet::from_labels(labels.iter().copied()));
        self.state
            .add_resource_unit(unit)
            .await
            .expect("failed to add resource unit");
    }

    /// Spins until `cond` holds or the timeout elapses.
    pub async fn wait_until<F>(&self, mut cond: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Builds an instance description the scheduler accepts.
pub fn make_instance(instance_id: &str, priority: u16, cpu: u64, memory: u64) -> InstanceInfo {
    InstanceInfo {
        instance_id: instance_id.to_string(),
        request_id: format!("req-{instance_id}"),
        trace_id: format!("trace-{instance_id}"),
        function_urn: "fn:echo".to_string(),
        owner_node: String::new(),
        resources: Resources::new(cpu, memory),
        labels: Vec::new(),
        schedule_options: ScheduleOptions {
            priority,
            preempted_allowed: false,
            affinity: Affinity::default(),
            schedule_timeout_ms: 0,
            resource_group: None,
        },
        state: InstanceState::Scheduling,
        exit_code: 0,
        group_id: None,
        parent_instance_id: None,
        named_instance: None,
        sub_health: false,
    }
}
