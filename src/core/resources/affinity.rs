// src/core/resources/affinity.rs

//! Affinity selectors and their matching/scoring rules, shared by the
//! placement scorer, the preemption controller, and the fairness policy.
//!
//! A selector is a list of sub-conditions. Expressions inside one
//! sub-condition are conjunctive; sub-conditions are disjunctive against
//! each other, and the first satisfied sub-condition contributes its weight
//! as the selector's score.

use super::labels::LabelSet;
use serde::{Deserialize, Serialize};

/// Score returned when a required selector carrying `order_priority` is not
/// met by any sub-condition; callers must skip the unit entirely.
pub const REQUIRED_AFFINITY_PRIORITY_NOT_MET: i64 = -1;

/// A predicate over the counted value set of a single label key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOperator {
    In(Vec<String>),
    NotIn(Vec<String>),
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelExpression {
    pub key: String,
    pub op: LabelOperator,
}

impl LabelExpression {
    pub fn exists(key: impl Into<String>) -> Self {
        LabelExpression {
            key: key.into(),
            op: LabelOperator::Exists,
        }
    }

    pub fn not_exists(key: impl Into<String>) -> Self {
        LabelExpression {
            key: key.into(),
            op: LabelOperator::NotExists,
        }
    }

    pub fn in_values(key: impl Into<String>, values: Vec<String>) -> Self {
        LabelExpression {
            key: key.into(),
            op: LabelOperator::In(values),
        }
    }

    /// Evaluates this expression against a label multiset.
    pub fn matches(&self, labels: &LabelSet) -> bool {
        match &self.op {
            LabelOperator::In(values) => labels.key_has_any_value(&self.key, values),
            LabelOperator::NotIn(values) => !labels.key_has_any_value(&self.key, values),
            LabelOperator::Exists => labels.contains_key(&self.key),
            LabelOperator::NotExists => !labels.contains_key(&self.key),
        }
    }
}

/// One conjunctive group of expressions with a scoring weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubCondition {
    pub expressions: Vec<LabelExpression>,
    #[serde(default)]
    pub weight: i64,
}

impl SubCondition {
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.expressions.iter().all(|e| e.matches(labels))
    }
}

/// A full selector: disjunctive sub-conditions, optionally scored in
/// priority order rather than enforced as a hard gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub sub_conditions: Vec<SubCondition>,
    /// When set on a required selector, the selector participates in
    /// scoring instead of hard filtering; a zero score disqualifies the
    /// unit (score −1).
    #[serde(default)]
    pub order_priority: bool,
}

impl Selector {
    pub fn single(expressions: Vec<LabelExpression>) -> Self {
        Selector {
            sub_conditions: vec![SubCondition {
                expressions,
                weight: 1,
            }],
            order_priority: false,
        }
    }

    /// True when any sub-condition is fully satisfied.
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.sub_conditions.iter().any(|sc| sc.matches(labels))
    }

    /// The weight of the first satisfied sub-condition, 0 when none match.
    /// With `anti` set, a sub-condition scores when it is NOT satisfied.
    pub fn score(&self, labels: &LabelSet, anti: bool) -> i64 {
        for sub in &self.sub_conditions {
            let mut satisfied = sub.matches(labels);
            if anti {
                satisfied = !satisfied;
            }
            if satisfied {
                // Earlier sub-conditions outrank later ones; the first hit wins.
                return sub.weight;
            }
        }
        0
    }
}

/// The four selector slots of one affinity scope (resource or instance).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSet {
    #[serde(default)]
    pub required: Option<Selector>,
    #[serde(default)]
    pub required_anti: Option<Selector>,
    #[serde(default)]
    pub preferred: Option<Selector>,
    #[serde(default)]
    pub preferred_anti: Option<Selector>,
}

impl SelectorSet {
    pub fn has_required(&self) -> bool {
        self.required.is_some() || self.required_anti.is_some()
    }

    /// A copy with the preferred slots cleared, used to build the canonical
    /// fairness key from the required slots alone.
    pub fn required_only(&self) -> SelectorSet {
        SelectorSet {
            required: self.required.clone(),
            required_anti: self.required_anti.clone(),
            preferred: None,
            preferred_anti: None,
        }
    }
}

/// The affinity message carried in an instance's schedule options. The
/// `pending` list is attached by the fairness policy just before dispatch so
/// placement can avoid starving parked requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    #[serde(default)]
    pub resource: Option<SelectorSet>,
    #[serde(default)]
    pub instance: Option<SelectorSet>,
    #[serde(default)]
    pub pending: Vec<SelectorSet>,
}

impl Affinity {
    /// Whether the resource scope carries any required selector.
    pub fn has_resource_required(&self) -> bool {
        self.resource.as_ref().is_some_and(|r| r.has_required())
    }

    /// The canonical serialization of the resource required selectors, used
    /// as the fairness policy's conflict key. `None` when the instance has
    /// no resource required affinity at all.
    pub fn resource_required_key(&self) -> Option<String> {
        let set = self.resource.as_ref()?;
        if !set.has_required() {
            return None;
        }
        // Preferred slots do not contribute to conflicts.
        serde_json::to_string(&set.required_only()).ok()
    }
}

/// Hard filter for a required selector.
pub fn required_filter(selector: &Selector, labels: &LabelSet) -> bool {
    selector.matches(labels)
}

/// Hard filter for a required anti-selector: passes when the selector does
/// NOT match.
pub fn required_anti_filter(selector: &Selector, labels: &LabelSet) -> bool {
    !selector.matches(labels)
}

/// Whether the hard (non-priority) resource required selectors pass for a
/// unit with the given labels.
pub fn resource_required_passed(affinity: &Affinity, labels: &LabelSet) -> bool {
    let Some(resource) = &affinity.resource else {
        return true;
    };
    if let Some(required) = &resource.required {
        if !required.order_priority && !required_filter(required, labels) {
            return false;
        }
    }
    if let Some(required_anti) = &resource.required_anti {
        if !required_anti.order_priority && !required_anti_filter(required_anti, labels) {
            return false;
        }
    }
    true
}

/// Scores one selector set against a label multiset. Preferred selectors
/// contribute their weight; required selectors with `order_priority` must
/// score non-zero or the whole result is
/// [`REQUIRED_AFFINITY_PRIORITY_NOT_MET`].
fn score_selector_set(set: &SelectorSet, labels: &LabelSet) -> i64 {
    let mut total = 0;
    if let Some(preferred) = &set.preferred {
        total += preferred.score(labels, false);
    }
    if let Some(preferred_anti) = &set.preferred_anti {
        total += preferred_anti.score(labels, true);
    }
    if let Some(required) = &set.required {
        if required.order_priority {
            let score = required.score(labels, false);
            if score == 0 {
                return REQUIRED_AFFINITY_PRIORITY_NOT_MET;
            }
            total += score;
        }
    }
    if let Some(required_anti) = &set.required_anti {
        if required_anti.order_priority {
            let score = required_anti.score(labels, true);
            if score == 0 {
                return REQUIRED_AFFINITY_PRIORITY_NOT_MET;
            }
            total += score;
        }
    }
    total
}

/// The resource-scope affinity score of a unit, −1 when a priority-required
/// selector is unmet.
pub fn resource_affinity_score(affinity: &Affinity, labels: &LabelSet) -> i64 {
    match &affinity.resource {
        Some(set) => score_selector_set(set, labels),
        None => 0,
    }
}

/// The instance-scope affinity score of a unit (or of a single instance's
/// label set), −1 when a priority-required selector is unmet.
pub fn instance_affinity_score(affinity: &Affinity, labels: &LabelSet) -> i64 {
    match &affinity.instance {
        Some(set) => score_selector_set(set, labels),
        None => 0,
    }
}
