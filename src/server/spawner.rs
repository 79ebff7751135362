// src/server/spawner.rs

//! Spawns the server's background tasks: the scheduler actor, its tick
//! source, and the heartbeat monitor.

use crate::core::instances::InstanceState;
use crate::core::metrics;
use crate::core::scheduler::{
    InstancePerformer, PriorityScheduler, PriorityPolicyKind, ScheduleRecorder,
};
use crate::core::state::{SchedulerMsg, ServerState};
use crate::config::SchedulePolicy;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Spawns every background task; each stops when the shutdown channel fires.
pub async fn spawn_background_tasks(
    state: Arc<ServerState>,
    scheduler_rx: mpsc::Receiver<SchedulerMsg>,
    shutdown_tx: &broadcast::Sender<()>,
) {
    spawn_scheduler_actor(state.clone(), scheduler_rx, shutdown_tx.subscribe()).await;
    spawn_heartbeat_monitor(state.clone(), shutdown_tx.subscribe()).await;
}

/// The scheduler actor: owns the priority scheduler exclusively and applies
/// every mailbox message and tick on one task, so queue state never needs a
/// lock.
async fn spawn_scheduler_actor(
    state: Arc<ServerState>,
    mut rx: mpsc::Receiver<SchedulerMsg>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (policy, aggregate, tick_interval) = {
        let config = state.config.lock().await;
        let policy = match config.scheduler.policy {
            SchedulePolicy::Fifo => PriorityPolicyKind::Fifo,
            SchedulePolicy::Fairness => PriorityPolicyKind::Fairness,
        };
        (policy, config.scheduler.aggregate, config.scheduler.tick_interval)
    };
    let recorder: Arc<ScheduleRecorder> = state.recorder.clone();
    let mut scheduler = PriorityScheduler::new(
        policy,
        aggregate,
        Arc::new(InstancePerformer::new()),
        recorder,
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("scheduler actor started (tick every {:?})", tick_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("scheduler actor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    run_tick(&state, &mut scheduler);
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        info!("scheduler mailbox closed, actor exiting");
                        return;
                    };
                    match msg {
                        SchedulerMsg::Enqueue(item) => {
                            debug!("{}|scheduler enqueue", item.request_id());
                            scheduler.enqueue(item);
                            // Schedule eagerly instead of waiting a tick.
                            run_tick(&state, &mut scheduler);
                        }
                        SchedulerMsg::Cancel { id, reason } => {
                            scheduler.try_cancel(&id, &reason);
                        }
                        SchedulerMsg::Tick => {
                            run_tick(&state, &mut scheduler);
                        }
                    }
                }
            }
        }
    });
}

/// One scheduling pass against a fresh snapshot.
fn run_tick(state: &Arc<ServerState>, scheduler: &mut PriorityScheduler) {
    scheduler.handle_resource_info_update(state.view.snapshot());
    scheduler.activate_pending_requests();
    scheduler.consume_running_queue();
    metrics::PENDING_QUEUE_DEPTH.set(scheduler.pending_len() as f64);
    metrics::RESOURCE_UNITS.set(state.view.unit_count() as f64);
    metrics::TRACKED_INSTANCES.set(state.registry.len() as f64);
}

/// Periodically sweeps heartbeats; instances that went silent degrade to
/// sub-health and then FATAL, which feeds the group failure cascade.
async fn spawn_heartbeat_monitor(
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let heartbeat = { state.config.lock().await.heartbeat.clone() };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = ticker.tick() => {}
            }
            let fatal = state
                .registry
                .sweep_heartbeats(heartbeat.sub_health_after, heartbeat.fatal_after);
            for info in fatal {
                metrics::HEARTBEAT_LOST_TOTAL.inc();
                // Persist the FATAL state so watchers observe it, then let
                // the group manager run the cascade.
                if let Err(e) = state.registry.persist(&state.meta, &info.instance_id).await {
                    tracing::error!(
                        "failed to persist FATAL state of {}: {}",
                        info.instance_id,
                        e
                    );
                }
                debug_assert_eq!(info.state, InstanceState::Fatal);
                state.group_manager.instance_fatal(info).await;
            }
        }
    });
}
