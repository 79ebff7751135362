// src/core/scheduler/queue.rs

//! The two schedule-queue implementations: time-sorted (priority DESC then
//! enqueue order ASC) and aggregated (same-shape same-priority instance
//! requests collapse into one slot carrying a FIFO of the originals).

use super::item::{AggregatedItem, QueueItem};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// The queue contract shared by the running and pending queues.
pub trait ScheduleQueue: Send {
    fn enqueue(&mut self, item: QueueItem);

    fn dequeue(&mut self) -> Option<QueueItem>;

    fn front(&self) -> Option<QueueItem>;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    /// Drains every item in priority order; used by `extend`.
    fn drain(&mut self) -> Vec<QueueItem>;

    /// Splices another queue's items behind this queue's own at equal
    /// priority: the receiving queue's items keep precedence.
    fn extend(&mut self, other: &mut dyn ScheduleQueue) {
        for item in other.drain() {
            self.enqueue(item);
        }
    }
}

/// Priority DESC, then enqueue order ASC. Re-enqueueing after `extend`
/// stamps a fresh sequence, which is what gives the pending queue's items
/// precedence once they absorb the running queue.
#[derive(Default)]
pub struct TimeSortedQueue {
    items: BTreeMap<(Reverse<u16>, u64), QueueItem>,
    next_seq: u64,
}

impl TimeSortedQueue {
    pub fn new() -> Self {
        Default::default()
    }
}

impl ScheduleQueue for TimeSortedQueue {
    fn enqueue(&mut self, item: QueueItem) {
        let key = (Reverse(item.priority()), self.next_seq);
        self.next_seq += 1;
        self.items.insert(key, item);
    }

    fn dequeue(&mut self) -> Option<QueueItem> {
        let key = *self.items.keys().next()?;
        self.items.remove(&key)
    }

    fn front(&self) -> Option<QueueItem> {
        self.items.values().next().cloned()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn drain(&mut self) -> Vec<QueueItem> {
        let drained = std::mem::take(&mut self.items);
        drained.into_values().collect()
    }
}

/// Collapses instance items with an identical aggregate key (function urn +
/// resource shape + priority) into one `AggregatedItem`. Groups and items
/// that cannot aggregate occupy their own slot.
#[derive(Default)]
pub struct AggregatedQueue {
    items: BTreeMap<(Reverse<u16>, u64), QueueItem>,
    /// aggregate key → position of its live slot in `items`.
    aggregates: HashMap<String, (Reverse<u16>, u64)>,
    next_seq: u64,
}

impl AggregatedQueue {
    pub fn new() -> Self {
        Default::default()
    }

    fn aggregate_key(item: &super::item::InstanceItem) -> String {
        // The resource shape participates via its canonical JSON rendering.
        let shape = serde_json::to_string(&item.instance.resources).unwrap_or_default();
        format!(
            "{}|{}|{}",
            item.instance.function_urn,
            shape,
            item.priority()
        )
    }
}

impl ScheduleQueue for AggregatedQueue {
    fn enqueue(&mut self, item: QueueItem) {
        let instance = match item {
            QueueItem::Instance(instance) => instance,
            other => {
                // Groups (and anything already aggregated) keep their own slot.
                let key = (Reverse(other.priority()), self.next_seq);
                self.next_seq += 1;
                self.items.insert(key, other);
                return;
            }
        };
        let agg_key = Self::aggregate_key(&instance);
        if let Some(slot) = self.aggregates.get(&agg_key) {
            if let Some(QueueItem::Aggregated(existing)) = self.items.get(slot) {
                existing.push(instance);
                return;
            }
        }
        let aggregated = Arc::new(AggregatedItem::new(agg_key.clone(), instance.priority()));
        aggregated.push(instance);
        let key = (Reverse(aggregated.priority), self.next_seq);
        self.next_seq += 1;
        self.aggregates.insert(agg_key, key);
        self.items.insert(key, QueueItem::Aggregated(aggregated));
    }

    fn dequeue(&mut self) -> Option<QueueItem> {
        let key = *self.items.keys().next()?;
        let item = self.items.remove(&key)?;
        if let QueueItem::Aggregated(aggregated) = &item {
            self.aggregates.remove(&aggregated.aggregate_key);
        }
        Some(item)
    }

    fn front(&self) -> Option<QueueItem> {
        self.items.values().next().cloned()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn drain(&mut self) -> Vec<QueueItem> {
        self.aggregates.clear();
        let drained = std::mem::take(&mut self.items);
        drained.into_values().collect()
    }
}
