// tests/integration/queue_test.rs

//! Tests of the schedule queues: time-sorted ordering, extend precedence,
//! and aggregation of same-shape requests.

use super::test_helpers::make_instance;
use stratus::core::scheduler::item::{InstanceItem, QueueItem};
use stratus::core::scheduler::queue::{AggregatedQueue, ScheduleQueue, TimeSortedQueue};

fn item(id: &str, priority: u16) -> QueueItem {
    let (item, _rx) = InstanceItem::new(make_instance(id, priority, 100, 100));
    QueueItem::Instance(item)
}

#[test]
fn test_time_sorted_priority_desc_then_fifo() {
    let mut queue = TimeSortedQueue::new();
    queue.enqueue(item("low-1", 1));
    queue.enqueue(item("high", 5));
    queue.enqueue(item("low-2", 1));

    assert_eq!(queue.dequeue().unwrap().request_id(), "req-high");
    assert_eq!(queue.dequeue().unwrap().request_id(), "req-low-1");
    assert_eq!(queue.dequeue().unwrap().request_id(), "req-low-2");
    assert!(queue.is_empty());
}

#[test]
fn test_front_does_not_consume() {
    let mut queue = TimeSortedQueue::new();
    queue.enqueue(item("a", 1));
    assert_eq!(queue.front().unwrap().request_id(), "req-a");
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_extend_gives_receiver_items_precedence() {
    // The pending queue absorbs the running queue: at equal priority the
    // pending (receiving) queue's items must come out first.
    let mut pending = TimeSortedQueue::new();
    let mut running = TimeSortedQueue::new();
    running.enqueue(item("running-1", 3));
    pending.enqueue(item("pending-1", 3));

    pending.extend(&mut running);
    assert!(running.is_empty());
    assert_eq!(pending.dequeue().unwrap().request_id(), "req-pending-1");
    assert_eq!(pending.dequeue().unwrap().request_id(), "req-running-1");
}

#[test]
fn test_aggregated_queue_collapses_same_shape() {
    let mut queue = AggregatedQueue::new();
    queue.enqueue(item("a", 2));
    queue.enqueue(item("b", 2));
    // A different priority must not aggregate with them.
    queue.enqueue(item("c", 4));

    assert_eq!(queue.len(), 2);
    let first = queue.dequeue().unwrap();
    match first {
        QueueItem::Aggregated(agg) => {
            assert_eq!(agg.priority, 4);
            assert_eq!(agg.len(), 1);
        }
        other => panic!("expected aggregated item, got {other:?}"),
    }
    let second = queue.dequeue().unwrap();
    match second {
        QueueItem::Aggregated(agg) => {
            assert_eq!(agg.priority, 2);
            assert_eq!(agg.len(), 2);
        }
        other => panic!("expected aggregated item, got {other:?}"),
    }
}

#[test]
fn test_aggregated_queue_separates_different_shapes() {
    let mut queue = AggregatedQueue::new();
    let (small, _rx) = InstanceItem::new(make_instance("small", 1, 100, 100));
    let (large, _rx) = InstanceItem::new(make_instance("large", 1, 900, 900));
    queue.enqueue(QueueItem::Instance(small));
    queue.enqueue(QueueItem::Instance(large));
    assert_eq!(queue.len(), 2);
}
