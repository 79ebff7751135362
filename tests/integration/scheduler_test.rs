// tests/integration/scheduler_test.rs

//! Tests of the priority scheduler loop: placement, fairness gating,
//! pending activation, cancellation, and pending-timeout expiry.

use super::test_helpers::make_instance;
use std::sync::Arc;
use std::time::Duration;
use stratus::core::errors::StatusCode;
use stratus::core::instances::InstanceInfo;
use stratus::core::resources::{
    LabelExpression, LabelSet, ResourceUnit, ResourceView, Resources, Selector, SelectorSet,
};
use stratus::core::scheduler::item::{GroupOptions, GroupScheduleItem, InstanceItem, QueueItem};
use stratus::core::scheduler::{
    InstancePerformer, PriorityPolicyKind, PriorityScheduler, ScheduleRecorder, ScheduleResult,
};
use tokio::sync::oneshot;

fn new_scheduler() -> PriorityScheduler {
    PriorityScheduler::new(
        PriorityPolicyKind::Fairness,
        false,
        Arc::new(InstancePerformer::new()),
        Arc::new(ScheduleRecorder::new()),
    )
}

fn tick(scheduler: &mut PriorityScheduler, view: &ResourceView) {
    scheduler.handle_resource_info_update(view.snapshot());
    scheduler.activate_pending_requests();
    scheduler.consume_running_queue();
}

fn with_required(mut info: InstanceInfo, key: &str) -> InstanceInfo {
    info.schedule_options.affinity.resource = Some(SelectorSet {
        required: Some(Selector::single(vec![LabelExpression::exists(key)])),
        ..Default::default()
    });
    info
}

fn take(rx: &mut oneshot::Receiver<ScheduleResult>) -> Option<ScheduleResult> {
    rx.try_recv().ok()
}

#[test]
fn test_simple_fit_places_on_the_only_unit() {
    let view = ResourceView::new();
    view.add_unit(ResourceUnit::new("u1", "n1", Resources::new(1000, 1000)));
    let mut scheduler = new_scheduler();

    let (item, mut rx) = InstanceItem::new(make_instance("a", 1, 500, 500));
    scheduler.enqueue(QueueItem::Instance(item));
    tick(&mut scheduler, &view);

    let result = take(&mut rx).expect("schedule must complete");
    assert!(result.is_success());
    assert_eq!(result.placements.len(), 1);
    assert_eq!(result.placements[0].unit_id, "u1");

    // Committing the placement leaves 500/500 allocatable.
    view.add_instances("u1", vec![make_instance("a", 1, 500, 500)])
        .unwrap();
    assert_eq!(
        view.snapshot().unit("u1").unwrap().allocatable,
        Resources::new(500, 500)
    );
}

#[test]
fn test_resource_shortage_without_timeout_fails_immediately() {
    let view = ResourceView::new();
    view.add_unit(ResourceUnit::new("u1", "n1", Resources::new(100, 100)));
    let mut scheduler = new_scheduler();

    let (item, mut rx) = InstanceItem::new(make_instance("big", 1, 500, 500));
    scheduler.enqueue(QueueItem::Instance(item));
    tick(&mut scheduler, &view);

    let result = take(&mut rx).expect("schedule must complete");
    assert_eq!(result.code, StatusCode::ResourceNotEnough);
}

#[test]
fn test_fairness_blocks_similar_demand() {
    let view = ResourceView::new();
    view.add_unit(
        ResourceUnit::new("u1", "n1", Resources::new(1000, 1000))
            .with_base_labels(LabelSet::from_labels(["poolB"])),
    );
    let mut scheduler = new_scheduler();

    // r1 requires poolA (which no unit offers) and tolerates waiting: it
    // parks in the pending queue and registers its affinity.
    let mut r1 = with_required(make_instance("r1", 3, 100, 100), "poolA");
    r1.schedule_options.schedule_timeout_ms = 5000;
    let (item1, mut rx1) = InstanceItem::new(r1);
    scheduler.enqueue(QueueItem::Instance(item1));
    tick(&mut scheduler, &view);
    assert!(take(&mut rx1).is_none());
    assert_eq!(scheduler.pending_len(), 1);

    // r2 shares r1's affinity: it must go straight to pending without a
    // scheduling attempt.
    let mut r2 = with_required(make_instance("r2", 3, 100, 100), "poolA");
    r2.schedule_options.schedule_timeout_ms = 5000;
    let (item2, mut rx2) = InstanceItem::new(r2);
    scheduler.enqueue(QueueItem::Instance(item2));
    assert!(take(&mut rx2).is_none());
    assert_eq!(scheduler.pending_len(), 2);

    // r3 has a different affinity and schedules normally.
    let r3 = with_required(make_instance("r3", 3, 100, 100), "poolB");
    let (item3, mut rx3) = InstanceItem::new(r3);
    scheduler.enqueue(QueueItem::Instance(item3));
    tick(&mut scheduler, &view);

    let result = take(&mut rx3).expect("r3 must schedule");
    assert!(result.is_success());
    assert_eq!(result.placements[0].unit_id, "u1");
}

#[test]
fn test_pending_item_admitted_once_capacity_appears() {
    let view = ResourceView::new();
    view.add_unit(ResourceUnit::new("u1", "n1", Resources::new(100, 100)));
    let mut scheduler = new_scheduler();

    let mut starved = make_instance("starved", 1, 500, 500);
    starved.schedule_options.schedule_timeout_ms = 60_000;
    let (item, mut rx) = InstanceItem::new(starved);
    scheduler.enqueue(QueueItem::Instance(item));
    tick(&mut scheduler, &view);
    assert!(take(&mut rx).is_none());
    assert_eq!(scheduler.pending_len(), 1);

    // Capacity arrives; the next tick activates pending and places it.
    view.add_unit(ResourceUnit::new("u2", "n2", Resources::new(1000, 1000)));
    tick(&mut scheduler, &view);

    let result = take(&mut rx).expect("pending item must eventually place");
    assert!(result.is_success());
    assert_eq!(result.placements[0].unit_id, "u2");
}

#[test]
fn test_cancellation_completes_with_canceled_code() {
    let view = ResourceView::new();
    view.add_unit(ResourceUnit::new("u1", "n1", Resources::new(1000, 1000)));
    let mut scheduler = new_scheduler();

    let (item, mut rx) = InstanceItem::new(make_instance("victim", 1, 100, 100));
    let request_id = item.request_id.clone();
    scheduler.enqueue(QueueItem::Instance(item));
    assert!(scheduler.try_cancel(&request_id, "caller went away"));
    tick(&mut scheduler, &view);

    let result = take(&mut rx).expect("canceled item must complete");
    assert_eq!(result.code, StatusCode::ScheduleCanceled);
}

#[test]
fn test_pending_deadline_expires_with_timeout_code() {
    let view = ResourceView::new();
    view.add_unit(ResourceUnit::new("u1", "n1", Resources::new(100, 100)));
    let mut scheduler = new_scheduler();

    let mut doomed = make_instance("doomed", 1, 500, 500);
    doomed.schedule_options.schedule_timeout_ms = 30;
    let (item, mut rx) = InstanceItem::new(doomed);
    scheduler.enqueue(QueueItem::Instance(item));
    tick(&mut scheduler, &view);
    assert!(take(&mut rx).is_none());

    std::thread::sleep(Duration::from_millis(50));
    tick(&mut scheduler, &view);

    let result = take(&mut rx).expect("overdue item must complete");
    assert_eq!(result.code, StatusCode::RequestTimeOut);
    // The reason carries the last recorded schedule error.
    assert!(!result.reason.is_empty());
}

#[test]
fn test_group_places_all_members_or_none() {
    let view = ResourceView::new();
    view.add_unit(ResourceUnit::new("u1", "n1", Resources::new(1000, 1000)));
    let mut scheduler = new_scheduler();

    // Two 600/600 members cannot both fit on a 1000/1000 unit.
    let (too_big, mut rx_big) = GroupScheduleItem::new(
        "req-g1".to_string(),
        "g1".to_string(),
        GroupOptions::default(),
        vec![
            make_instance("m1", 1, 600, 600),
            make_instance("m2", 1, 600, 600),
        ],
    );
    scheduler.enqueue(QueueItem::Group(too_big));
    tick(&mut scheduler, &view);
    let result = take(&mut rx_big).expect("group schedule must complete");
    assert_eq!(result.code, StatusCode::ResourceNotEnough);

    // The failed group left no reservations behind: a single 800/800
    // instance still fits in the same pass cycle.
    let (single, mut rx_single) = InstanceItem::new(make_instance("s", 1, 800, 800));
    scheduler.enqueue(QueueItem::Instance(single));
    tick(&mut scheduler, &view);
    assert!(take(&mut rx_single).unwrap().is_success());
}

#[test]
fn test_group_members_co_locate_through_bundle_labels() {
    let view = ResourceView::new();
    view.add_unit(ResourceUnit::new("u1", "n1", Resources::new(1000, 1000)));
    view.add_unit(ResourceUnit::new("u2", "n2", Resources::new(1000, 1000)));
    let mut scheduler = new_scheduler();

    // Member 0 declares the bundle label; member 1 requires it, so both
    // must land on the same unit.
    let mut m0 = make_instance("m0", 1, 100, 100);
    m0.labels = vec!["g_bundle_0".to_string()];
    let mut m1 = make_instance("m1", 1, 100, 100);
    m1.schedule_options.affinity.instance = Some(SelectorSet {
        required: Some(Selector::single(vec![LabelExpression::exists("g_bundle_0")])),
        ..Default::default()
    });

    let (group, mut rx) = GroupScheduleItem::new(
        "req-g2".to_string(),
        "g2".to_string(),
        GroupOptions::default(),
        vec![m0, m1],
    );
    scheduler.enqueue(QueueItem::Group(group));
    tick(&mut scheduler, &view);

    let result = take(&mut rx).expect("group schedule must complete");
    assert!(result.is_success(), "unexpected failure: {}", result.reason);
    assert_eq!(result.placements.len(), 2);
    assert_eq!(result.placements[0].unit_id, result.placements[1].unit_id);
}

#[test]
fn test_preemption_through_the_performer() {
    let view = ResourceView::new();
    let mut low = make_instance("low", 1, 100, 100);
    low.schedule_options.preempted_allowed = true;
    view.add_unit(ResourceUnit::new("u1", "n1", Resources::new(100, 100)));
    view.add_instances("u1", vec![low]).unwrap();
    let mut scheduler = new_scheduler();

    let (item, mut rx) = InstanceItem::new(make_instance("hi", 5, 100, 100));
    scheduler.enqueue(QueueItem::Instance(item));
    tick(&mut scheduler, &view);

    let result = take(&mut rx).expect("schedule must complete");
    assert!(result.is_success());
    assert_eq!(result.placements[0].evicted.len(), 1);
    assert_eq!(result.placements[0].evicted[0].instance_id, "low");
}
