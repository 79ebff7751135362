// tests/integration/preemption_test.rs

//! Tests of the preemption controller: victim selection, priority rules,
//! anti-affinity enforcement, and cross-unit result ordering.

use super::test_helpers::make_instance;
use stratus::core::errors::StatusCode;
use stratus::core::instances::InstanceInfo;
use stratus::core::resources::{
    LabelExpression, LabelSet, ResourceUnit, ResourceView, Resources, Selector, SelectorSet,
};
use stratus::core::scheduler::{PreAllocatedContext, PreemptionController};

fn preemptable(id: &str, priority: u16, cpu: u64, memory: u64) -> InstanceInfo {
    let mut info = make_instance(id, priority, cpu, memory);
    info.schedule_options.preempted_allowed = true;
    info
}

fn view_with(units: Vec<(ResourceUnit, Vec<InstanceInfo>)>) -> ResourceView {
    let view = ResourceView::new();
    for (unit, instances) in units {
        let unit_id = unit.unit_id.clone();
        view.add_unit(unit);
        view.add_instances(&unit_id, instances).unwrap();
    }
    view
}

#[test]
fn test_preempt_lower_priority_victim() {
    let view = view_with(vec![(
        ResourceUnit::new("u1", "n1", Resources::new(100, 100)),
        vec![preemptable("low", 1, 100, 100)],
    )]);
    let hi = make_instance("hi", 5, 100, 100);

    let controller = PreemptionController::new();
    let result = controller
        .preempt_decision(&PreAllocatedContext::default(), &hi, &view.snapshot())
        .unwrap();
    assert_eq!(result.unit_id, "u1");
    assert_eq!(result.victims.len(), 1);
    assert_eq!(result.victims[0].instance_id, "low");

    // Feasibility: applying the result leaves the candidate schedulable.
    view.remove_instances("u1", &["low".to_string()]).unwrap();
    let snapshot = view.snapshot();
    assert!(hi
        .resources
        .fits_within(&snapshot.unit("u1").unwrap().allocatable));
}

#[test]
fn test_victim_must_allow_preemption() {
    let view = view_with(vec![(
        ResourceUnit::new("u1", "n1", Resources::new(100, 100)),
        vec![make_instance("pinned", 1, 100, 100)],
    )]);
    let hi = make_instance("hi", 5, 100, 100);

    let err = PreemptionController::new()
        .preempt_decision(&PreAllocatedContext::default(), &hi, &view.snapshot())
        .unwrap_err();
    assert_eq!(err.code, StatusCode::NoPreemptableInstance);
}

#[test]
fn test_equal_priority_is_not_preemptable() {
    let view = view_with(vec![(
        ResourceUnit::new("u1", "n1", Resources::new(100, 100)),
        vec![preemptable("peer", 5, 100, 100)],
    )]);
    let hi = make_instance("hi", 5, 100, 100);

    let err = PreemptionController::new()
        .preempt_decision(&PreAllocatedContext::default(), &hi, &view.snapshot())
        .unwrap_err();
    assert_eq!(err.code, StatusCode::NoPreemptableInstance);
}

fn with_required_anti(mut info: InstanceInfo, key: &str) -> InstanceInfo {
    info.schedule_options.affinity.instance = Some(SelectorSet {
        required_anti: Some(Selector::single(vec![LabelExpression::exists(key)])),
        ..Default::default()
    });
    info
}

#[test]
fn test_anti_affinity_satisfied_by_evicting_the_label_carrier() {
    // The "foo" label exists only while `low` lives: preempting it removes
    // the label, so the anti-affinity candidate may take the unit.
    let mut low = preemptable("low", 1, 100, 100);
    low.labels = vec!["foo".to_string()];
    let view = view_with(vec![(
        ResourceUnit::new("u1", "n1", Resources::new(100, 100)),
        vec![low],
    )]);
    let hi = with_required_anti(make_instance("hi", 5, 100, 100), "foo");

    let result = PreemptionController::new()
        .preempt_decision(&PreAllocatedContext::default(), &hi, &view.snapshot())
        .unwrap();
    assert_eq!(result.unit_id, "u1");
    assert_eq!(result.victims[0].instance_id, "low");
}

#[test]
fn test_anti_affinity_on_static_label_fails_hard() {
    // Here "foo" is a static node label: no eviction can remove it, so the
    // unit stays infeasible for the anti-affinity candidate.
    let view = view_with(vec![(
        ResourceUnit::new("u1", "n1", Resources::new(100, 100))
            .with_base_labels(LabelSet::from_labels(["foo"])),
        vec![preemptable("low", 1, 100, 100)],
    )]);
    let hi = with_required_anti(make_instance("hi", 5, 100, 100), "foo");

    let err = PreemptionController::new()
        .preempt_decision(&PreAllocatedContext::default(), &hi, &view.snapshot())
        .unwrap_err();
    assert_eq!(err.code, StatusCode::NoPreemptableInstance);
}

#[test]
fn test_lowest_priority_victim_chosen_first() {
    let view = view_with(vec![(
        ResourceUnit::new("u1", "n1", Resources::new(200, 200)),
        vec![
            preemptable("mid", 2, 100, 100),
            preemptable("low", 1, 100, 100),
        ],
    )]);
    let hi = make_instance("hi", 5, 100, 100);

    let result = PreemptionController::new()
        .preempt_decision(&PreAllocatedContext::default(), &hi, &view.snapshot())
        .unwrap();
    assert_eq!(result.victims.len(), 1);
    assert_eq!(result.victims[0].instance_id, "low");
}

#[test]
fn test_bigger_victim_preferred_at_equal_priority() {
    // One big victim frees the target in one eviction; two small ones
    // would take two.
    let view = view_with(vec![(
        ResourceUnit::new("u1", "n1", Resources::new(150, 150)),
        vec![
            preemptable("small", 1, 50, 50),
            preemptable("big", 1, 100, 100),
        ],
    )]);
    let hi = make_instance("hi", 5, 100, 100);

    let result = PreemptionController::new()
        .preempt_decision(&PreAllocatedContext::default(), &hi, &view.snapshot())
        .unwrap();
    assert_eq!(result.victims.len(), 1);
    assert_eq!(result.victims[0].instance_id, "big");
}

#[test]
fn test_cross_unit_prefers_fewer_victims() {
    let view = view_with(vec![
        (
            ResourceUnit::new("u1", "n1", Resources::new(100, 100)),
            vec![
                preemptable("a1", 1, 50, 50),
                preemptable("a2", 1, 50, 50),
            ],
        ),
        (
            ResourceUnit::new("u2", "n2", Resources::new(100, 100)),
            vec![preemptable("b1", 1, 100, 100)],
        ),
    ]);
    let hi = make_instance("hi", 5, 100, 100);

    let result = PreemptionController::new()
        .preempt_decision(&PreAllocatedContext::default(), &hi, &view.snapshot())
        .unwrap();
    assert_eq!(result.unit_id, "u2");
    assert_eq!(result.victims.len(), 1);
}

#[test]
fn test_sub_health_victim_preferred_at_equal_priority() {
    let mut shaky = preemptable("shaky", 1, 100, 100);
    shaky.sub_health = true;
    let view = view_with(vec![(
        ResourceUnit::new("u1", "n1", Resources::new(200, 200)),
        vec![preemptable("steady", 1, 100, 100), shaky],
    )]);
    let hi = make_instance("hi", 5, 100, 100);

    let result = PreemptionController::new()
        .preempt_decision(&PreAllocatedContext::default(), &hi, &view.snapshot())
        .unwrap();
    assert_eq!(result.victims.len(), 1);
    assert_eq!(result.victims[0].instance_id, "shaky");
}

#[test]
fn test_pre_allocated_context_shrinks_capacity() {
    // A reservation from the same pass makes the unit too small even for
    // preemption.
    let view = view_with(vec![(
        ResourceUnit::new("u1", "n1", Resources::new(100, 100)),
        vec![preemptable("low", 1, 50, 50)],
    )]);
    let hi = make_instance("hi", 5, 100, 100);
    let mut ctx = PreAllocatedContext::default();
    ctx.reserve("u1", &Resources::new(50, 50), &LabelSet::new());

    let err = PreemptionController::new()
        .preempt_decision(&ctx, &hi, &view.snapshot())
        .unwrap_err();
    assert_eq!(err.code, StatusCode::NoPreemptableInstance);
}
