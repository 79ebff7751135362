// src/core/objects/waiting.rs

//! The multi-object wait primitive: block until at least `min_ready` of the
//! requested ids are ready or errored, or the timeout expires. A timeout is
//! not an error; it returns whatever partial result accumulated.

use super::store::ObjectStore;
use crate::core::errors::Status;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::debug;

/// One batch wait is capped at this long before the cancellation hook is
/// polled again.
const BATCH_WAIT_TIMEOUT_MS: i64 = 1000;
const WAIT_TIMEOUT_MS: i64 = 990;
const WAIT_INTERVAL_MS: u64 = 10;

/// The outcome of a `wait` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitResult {
    pub ready: Vec<String>,
    pub unready: Vec<String>,
    pub errors: HashMap<String, Status>,
}

/// Polled between wait batches; returning a non-OK status aborts every
/// in-flight wait with that status applied to the remaining ids.
pub type CheckSignals = Box<dyn Fn() -> Status + Send + Sync>;

#[derive(Default)]
struct EntityState {
    ready: Vec<String>,
    errors: HashMap<String, Status>,
    finished: bool,
}

/// One waiting caller. The atomic ready/error tally lives behind the state
/// mutex; completion fires exactly once when the threshold is reached.
struct WaitingEntity {
    min_ready: usize,
    state: Mutex<EntityState>,
    notify: Notify,
}

impl WaitingEntity {
    fn new(min_ready: usize) -> Self {
        WaitingEntity {
            min_ready,
            state: Mutex::new(EntityState::default()),
            notify: Notify::new(),
        }
    }

    fn on_ready(&self, id: &str) {
        let mut state = self.state.lock();
        state.ready.push(id.to_string());
        if state.ready.len() + state.errors.len() >= self.min_ready && !state.finished {
            state.finished = true;
            self.notify.notify_one();
        }
    }

    fn on_error(&self, id: &str, status: &Status) {
        let mut state = self.state.lock();
        state.errors.insert(id.to_string(), status.clone());
        if state.ready.len() + state.errors.len() >= self.min_ready && !state.finished {
            state.finished = true;
            self.notify.notify_one();
        }
    }

    async fn wait(&self, timeout_ms: i64) {
        if timeout_ms < 0 {
            self.notify.notified().await;
            return;
        }
        let _ = timeout(
            Duration::from_millis(timeout_ms as u64),
            self.notify.notified(),
        )
        .await;
    }

    fn take_results(&self) -> (Vec<String>, HashMap<String, Status>) {
        let state = self.state.lock();
        (state.ready.clone(), state.errors.clone())
    }
}

/// The outcome of starting one wait round.
enum WaitRound {
    Done(WaitResult),
    Pending(Arc<WaitingEntity>),
}

/// Tracks which object ids are still unready and which waiters subscribe to
/// them. The object store drives the transitions; waiters block here.
#[derive(Default)]
pub struct WaitManager {
    unready: Mutex<HashMap<String, Vec<Arc<WaitingEntity>>>>,
    check_signals: Mutex<Option<CheckSignals>>,
}

impl WaitManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Installs the shared cancellation hook polled between batch waits.
    pub fn set_check_signals(&self, hook: CheckSignals) {
        *self.check_signals.lock() = Some(hook);
    }

    /// Registers an id as unready. Returns false if it already was.
    pub fn set_unready(&self, id: &str) -> bool {
        let mut unready = self.unready.lock();
        if unready.contains_key(id) {
            return false;
        }
        unready.insert(id.to_string(), Vec::new());
        true
    }

    pub fn is_unready(&self, id: &str) -> bool {
        self.unready.lock().contains_key(id)
    }

    /// Marks an id ready, waking every subscribed waiter. Returns false if
    /// the id was not tracked as unready (a no-op re-ready).
    pub fn set_ready(&self, id: &str) -> bool {
        let entities = {
            let mut unready = self.unready.lock();
            match unready.remove(id) {
                Some(entities) => entities,
                None => return false,
            }
        };
        for entity in entities {
            entity.on_ready(id);
        }
        true
    }

    /// Marks an id errored, waking every subscribed waiter with the status.
    pub fn set_error(&self, id: &str, status: &Status) {
        debug!("wait manager: set error on {}: {}", id, status.message);
        let entities = {
            let mut unready = self.unready.lock();
            unready.remove(id).unwrap_or_default()
        };
        for entity in entities {
            entity.on_error(id, status);
        }
    }

    /// Drops every waiter and unready record; used at finalize.
    pub fn clear(&self, status: &Status) {
        let drained: Vec<(String, Vec<Arc<WaitingEntity>>)> =
            self.unready.lock().drain().collect();
        for (id, entities) in drained {
            for entity in entities {
                entity.on_error(&id, status);
            }
        }
    }

    /// One wait round: either the threshold is already reached from settled
    /// ids alone, or a freshly subscribed entity is returned to block on.
    fn begin_round(
        &self,
        store: &ObjectStore,
        ids: &[String],
        min_ready: usize,
    ) -> WaitRound {
        let mut result = WaitResult::default();
        let mut still_unready = Vec::new();
        let entity = {
            let mut unready = self.unready.lock();
            for id in ids {
                if !unready.contains_key(id) {
                    // Already settled: either a historical error or ready.
                    let status = store.get_last_error(id);
                    if status.is_err() {
                        result.errors.insert(id.clone(), status);
                    } else {
                        result.ready.push(id.clone());
                    }
                    continue;
                }
                still_unready.push(id.clone());
            }
            if result.ready.len() + result.errors.len() >= min_ready {
                result.unready = still_unready;
                return WaitRound::Done(result);
            }
            let entity = Arc::new(WaitingEntity::new(
                min_ready - result.ready.len() - result.errors.len(),
            ));
            for id in &still_unready {
                unready
                    .entry(id.clone())
                    .or_default()
                    .push(entity.clone());
            }
            entity
        };
        // The entity waits outside the lock; the caller finishes the round.
        WaitRound::Pending(entity)
    }

    /// Blocks until `min_ready` of `ids` are ready-or-error, the timeout
    /// expires (−1 waits forever), or the check-signals hook aborts.
    pub async fn wait_until_ready(
        &self,
        store: &ObjectStore,
        ids: &[String],
        min_ready: usize,
        timeout_ms: i64,
    ) -> WaitResult {
        let mut remaining = timeout_ms;
        loop {
            let current = if timeout_ms == -1 {
                BATCH_WAIT_TIMEOUT_MS
            } else {
                remaining.min(BATCH_WAIT_TIMEOUT_MS)
            };
            if remaining >= 0 {
                remaining -= current;
            }
            let last_wait = timeout_ms != -1 && remaining <= 0;

            let entity = match self.begin_round(store, ids, min_ready) {
                WaitRound::Done(result) => return result,
                WaitRound::Pending(entity) => entity,
            };
            entity.wait(current.min(WAIT_TIMEOUT_MS)).await;
            let (entity_ready, entity_errors) = entity.take_results();
            self.unsubscribe(ids, &entity);

            // Merge the entity's results with what was already settled.
            let mut result = self.collect_settled(store, ids, &entity_ready, &entity_errors);
            let done = result.ready.len() + result.errors.len() >= min_ready;
            if done || last_wait {
                result.unready = ids
                    .iter()
                    .filter(|id| {
                        !result.ready.contains(*id) && !result.errors.contains_key(*id)
                    })
                    .cloned()
                    .collect();
                return result;
            }

            if let Some(hook) = self.check_signals.lock().as_ref() {
                let status = hook();
                if status.is_err() {
                    let mut aborted = WaitResult::default();
                    for id in ids {
                        aborted.errors.insert(id.clone(), status.clone());
                    }
                    return aborted;
                }
            }
            tokio::time::sleep(Duration::from_millis(WAIT_INTERVAL_MS)).await;
        }
    }

    /// Settled view of `ids` merged with one entity's round results.
    fn collect_settled(
        &self,
        store: &ObjectStore,
        ids: &[String],
        entity_ready: &[String],
        entity_errors: &HashMap<String, Status>,
    ) -> WaitResult {
        let unready = self.unready.lock();
        let mut result = WaitResult::default();
        for id in ids {
            if let Some(status) = entity_errors.get(id) {
                result.errors.insert(id.clone(), status.clone());
                continue;
            }
            if entity_ready.contains(id) {
                result.ready.push(id.clone());
                continue;
            }
            if !unready.contains_key(id) {
                let status = store.get_last_error(id);
                if status.is_err() {
                    result.errors.insert(id.clone(), status);
                } else {
                    result.ready.push(id.clone());
                }
            }
        }
        result
    }

    fn unsubscribe(&self, ids: &[String], entity: &Arc<WaitingEntity>) {
        let mut unready = self.unready.lock();
        for id in ids {
            if let Some(entities) = unready.get_mut(id) {
                entities.retain(|e| !Arc::ptr_eq(e, entity));
            }
        }
    }
}
