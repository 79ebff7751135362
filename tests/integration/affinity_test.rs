// tests/integration/affinity_test.rs

//! Tests of label expressions, selector matching, and affinity scoring.

use stratus::core::resources::affinity::{
    instance_affinity_score, resource_affinity_score, resource_required_passed,
    REQUIRED_AFFINITY_PRIORITY_NOT_MET,
};
use stratus::core::resources::{
    Affinity, LabelExpression, LabelSet, Selector, SelectorSet, SubCondition,
};

fn labels(entries: &[&str]) -> LabelSet {
    LabelSet::from_labels(entries.iter().copied())
}

#[test]
fn test_label_expression_operators() {
    let set = labels(&["zone=a", "pool"]);

    assert!(LabelExpression::exists("zone").matches(&set));
    assert!(LabelExpression::exists("pool").matches(&set));
    assert!(!LabelExpression::exists("missing").matches(&set));
    assert!(LabelExpression::not_exists("missing").matches(&set));

    assert!(LabelExpression::in_values("zone", vec!["a".into(), "b".into()]).matches(&set));
    assert!(!LabelExpression::in_values("zone", vec!["c".into()]).matches(&set));

    let not_in = LabelExpression {
        key: "zone".to_string(),
        op: stratus::core::resources::LabelOperator::NotIn(vec!["c".into()]),
    };
    assert!(not_in.matches(&set));
}

#[test]
fn test_selector_disjunctive_across_sub_conditions() {
    // Two sub-conditions: (zone=a AND pool) OR (zone=b).
    let selector = Selector {
        sub_conditions: vec![
            SubCondition {
                expressions: vec![
                    LabelExpression::in_values("zone", vec!["a".into()]),
                    LabelExpression::exists("pool"),
                ],
                weight: 10,
            },
            SubCondition {
                expressions: vec![LabelExpression::in_values("zone", vec!["b".into()])],
                weight: 5,
            },
        ],
        order_priority: false,
    };

    assert!(selector.matches(&labels(&["zone=a", "pool"])));
    assert!(selector.matches(&labels(&["zone=b"])));
    // First group partially satisfied, second unsatisfied.
    assert!(!selector.matches(&labels(&["zone=a"])));
}

#[test]
fn test_selector_score_takes_first_satisfied_weight() {
    let selector = Selector {
        sub_conditions: vec![
            SubCondition {
                expressions: vec![LabelExpression::exists("gold")],
                weight: 100,
            },
            SubCondition {
                expressions: vec![LabelExpression::exists("silver")],
                weight: 10,
            },
        ],
        order_priority: false,
    };

    // Both match, but the earlier group wins.
    assert_eq!(selector.score(&labels(&["gold", "silver"]), false), 100);
    assert_eq!(selector.score(&labels(&["silver"]), false), 10);
    assert_eq!(selector.score(&labels(&[]), false), 0);
    // Anti scoring rewards the absence.
    assert_eq!(selector.score(&labels(&[]), true), 100);
}

#[test]
fn test_resource_required_hard_filter() {
    let affinity = Affinity {
        resource: Some(SelectorSet {
            required: Some(Selector::single(vec![LabelExpression::exists("poolA")])),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert!(resource_required_passed(&affinity, &labels(&["poolA"])));
    assert!(!resource_required_passed(&affinity, &labels(&["poolB"])));
}

#[test]
fn test_required_anti_hard_filter() {
    let affinity = Affinity {
        resource: Some(SelectorSet {
            required_anti: Some(Selector::single(vec![LabelExpression::exists("busy")])),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert!(resource_required_passed(&affinity, &labels(&["idle"])));
    assert!(!resource_required_passed(&affinity, &labels(&["busy"])));
}

#[test]
fn test_priority_required_scores_minus_one_when_unmet() {
    let affinity = Affinity {
        resource: Some(SelectorSet {
            required: Some(Selector {
                sub_conditions: vec![SubCondition {
                    expressions: vec![LabelExpression::exists("fast")],
                    weight: 7,
                }],
                order_priority: true,
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert_eq!(resource_affinity_score(&affinity, &labels(&["fast"])), 7);
    assert_eq!(
        resource_affinity_score(&affinity, &labels(&["slow"])),
        REQUIRED_AFFINITY_PRIORITY_NOT_MET
    );
}

#[test]
fn test_preferred_scores_accumulate_across_scopes() {
    let affinity = Affinity {
        resource: Some(SelectorSet {
            preferred: Some(Selector {
                sub_conditions: vec![SubCondition {
                    expressions: vec![LabelExpression::exists("ssd")],
                    weight: 3,
                }],
                order_priority: false,
            }),
            ..Default::default()
        }),
        instance: Some(SelectorSet {
            preferred: Some(Selector {
                sub_conditions: vec![SubCondition {
                    expressions: vec![LabelExpression::exists("peer")],
                    weight: 4,
                }],
                order_priority: false,
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let set = labels(&["ssd", "peer"]);
    assert_eq!(resource_affinity_score(&affinity, &set), 3);
    assert_eq!(instance_affinity_score(&affinity, &set), 4);
}

#[test]
fn test_resource_required_key_is_canonical_and_ignores_preferred() {
    let mut a = Affinity {
        resource: Some(SelectorSet {
            required: Some(Selector::single(vec![LabelExpression::exists("poolA")])),
            ..Default::default()
        }),
        ..Default::default()
    };
    let key_a = a.resource_required_key().unwrap();

    // Adding a preferred selector must not change the conflict key.
    a.resource.as_mut().unwrap().preferred =
        Some(Selector::single(vec![LabelExpression::exists("ssd")]));
    assert_eq!(a.resource_required_key().unwrap(), key_a);

    // No required selectors at all means no key.
    let none = Affinity {
        resource: Some(SelectorSet {
            preferred: Some(Selector::single(vec![LabelExpression::exists("ssd")])),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert!(none.resource_required_key().is_none());
}
