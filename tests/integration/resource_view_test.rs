// tests/integration/resource_view_test.rs

//! Tests of the cluster resource view: the allocatable invariant, label
//! multiset maintenance, and snapshot isolation.

use super::test_helpers::make_instance;
use stratus::core::resources::{LabelSet, ResourceUnit, ResourceView, Resources};

fn unit(id: &str, cpu: u64, memory: u64) -> ResourceUnit {
    ResourceUnit::new(id, format!("node-{id}"), Resources::new(cpu, memory))
}

#[test]
fn test_place_and_evict_maintains_allocatable_invariant() {
    let view = ResourceView::new();
    view.add_unit(unit("u1", 1000, 1000));

    let mut a = make_instance("a", 1, 500, 300);
    a.labels = vec!["poolA".to_string()];
    view.add_instances("u1", vec![a]).unwrap();

    let snapshot = view.snapshot();
    let u1 = snapshot.unit("u1").unwrap();
    assert_eq!(u1.allocatable, Resources::new(500, 700));
    assert!(u1.node_labels.contains_key("poolA"));

    // The invariant can be re-derived from scratch.
    let (recomputed, labels) = u1.recompute();
    assert_eq!(recomputed, u1.allocatable);
    assert_eq!(labels, u1.node_labels);

    view.remove_instances("u1", &["a".to_string()]).unwrap();
    let snapshot = view.snapshot();
    let u1 = snapshot.unit("u1").unwrap();
    assert_eq!(u1.allocatable, Resources::new(1000, 1000));
    assert!(!u1.node_labels.contains_key("poolA"));
}

#[test]
fn test_label_multiset_counts_duplicate_contributions() {
    let view = ResourceView::new();
    view.add_unit(unit("u1", 1000, 1000));

    let mut a = make_instance("a", 1, 100, 100);
    a.labels = vec!["shared".to_string()];
    let mut b = make_instance("b", 1, 100, 100);
    b.labels = vec!["shared".to_string()];
    view.add_instances("u1", vec![a, b]).unwrap();

    // Removing one contributor must keep the label alive.
    view.remove_instances("u1", &["a".to_string()]).unwrap();
    let snapshot = view.snapshot();
    assert!(snapshot.unit("u1").unwrap().node_labels.contains_key("shared"));

    view.remove_instances("u1", &["b".to_string()]).unwrap();
    let snapshot = view.snapshot();
    assert!(!snapshot.unit("u1").unwrap().node_labels.contains_key("shared"));
}

#[test]
fn test_snapshot_is_immutable_copy() {
    let view = ResourceView::new();
    view.add_unit(unit("u1", 1000, 1000));
    let before = view.snapshot();

    view.add_instances("u1", vec![make_instance("a", 1, 400, 400)])
        .unwrap();

    // The earlier snapshot still shows the pre-placement state.
    assert_eq!(
        before.unit("u1").unwrap().allocatable,
        Resources::new(1000, 1000)
    );
    assert_eq!(
        view.snapshot().unit("u1").unwrap().allocatable,
        Resources::new(600, 600)
    );
}

#[test]
fn test_update_unit_capacity_delta() {
    let view = ResourceView::new();
    view.add_unit(unit("u1", 1000, 1000));
    view.update_unit("u1", &Resources::new(500, 0), &Resources::new(0, 200))
        .unwrap();
    let snapshot = view.snapshot();
    let u1 = snapshot.unit("u1").unwrap();
    assert_eq!(u1.capacity, Resources::new(1500, 800));
    assert_eq!(u1.allocatable, Resources::new(1500, 800));
}

#[test]
fn test_all_local_labels_is_union_over_units() {
    let view = ResourceView::new();
    view.add_unit(
        unit("u1", 100, 100).with_base_labels(LabelSet::from_labels(["zoneA"])),
    );
    view.add_unit(
        unit("u2", 100, 100).with_base_labels(LabelSet::from_labels(["zoneB"])),
    );
    let snapshot = view.snapshot();
    assert!(snapshot.all_local_labels.contains_key("zoneA"));
    assert!(snapshot.all_local_labels.contains_key("zoneB"));
}

#[test]
fn test_find_instance_unit() {
    let view = ResourceView::new();
    view.add_unit(unit("u1", 1000, 1000));
    view.add_unit(unit("u2", 1000, 1000));
    view.add_instances("u2", vec![make_instance("a", 1, 10, 10)])
        .unwrap();
    assert_eq!(view.find_instance_unit("a").as_deref(), Some("u2"));
    assert_eq!(view.find_instance_unit("missing"), None);
}
