// src/core/scheduler/preemption.rs

//! The preemption controller: when ordinary placement fails, pick the best
//! resource unit and the cheapest victim set that frees enough capacity for
//! a higher-priority candidate, without breaking its affinity requirements.

use super::context::PreAllocatedContext;
use crate::core::errors::{Status, StatusCode};
use crate::core::instances::InstanceInfo;
use crate::core::resources::affinity::{
    self, required_anti_filter, required_filter, REQUIRED_AFFINITY_PRIORITY_NOT_MET,
};
use crate::core::resources::{LabelSet, ResourceUnit, Resources};
use crate::core::resources::view::ResourceViewInfo;
use std::cmp::Ordering;
use tracing::{info, warn};

/// How many infeasible units the debug record keeps for operator logs.
const INFEASIBLE_RECORD_LIMIT: usize = 5;

/// The decision: evict `victims` from `unit_id`, then the candidate fits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreemptResult {
    pub unit_id: String,
    pub owner_id: String,
    pub victims: Vec<InstanceInfo>,
}

/// One feasible unit with its victim set, ordered by the cross-unit rule.
#[derive(Debug, Clone)]
struct PreemptableUnit {
    unit_id: String,
    owner_id: String,
    score: i64,
    victims: Vec<InstanceInfo>,
    preempted_resources: Resources,
}

fn compare_preemptable_units(l: &PreemptableUnit, r: &PreemptableUnit) -> Ordering {
    // Highest total score first; then fewer victims; then the smaller
    // freed-resource overshoot; unit id as the final tiebreak.
    r.score
        .cmp(&l.score)
        .then(l.victims.len().cmp(&r.victims.len()))
        .then(l.preempted_resources.compare(&r.preempted_resources))
        .then(l.unit_id.cmp(&r.unit_id))
}

/// Victim ordering within a unit: lower priority first, sub-healthy before
/// healthy at equal priority, weaker affinity anchors first, then higher
/// resource usage (fewer victims reach the target), instance id last.
fn compare_victims(candidate: &InstanceInfo, l: &InstanceInfo, r: &InstanceInfo) -> Ordering {
    l.priority()
        .cmp(&r.priority())
        .then(r.sub_health.cmp(&l.sub_health))
        .then_with(|| {
            let l_score = affinity::instance_affinity_score(
                &candidate.schedule_options.affinity,
                &LabelSet::from_labels(&l.labels),
            );
            let r_score = affinity::instance_affinity_score(
                &candidate.schedule_options.affinity,
                &LabelSet::from_labels(&r.labels),
            );
            l_score.cmp(&r_score)
        })
        .then_with(|| r.resources.compare(&l.resources))
        .then_with(|| r.instance_id.cmp(&l.instance_id))
}

/// Operator-facing record of why units were skipped.
#[derive(Debug, Default)]
struct InfeasibleContext {
    infeasible_units: Vec<String>,
    no_preemptable_units: Vec<String>,
}

impl InfeasibleContext {
    fn insert_infeasible(&mut self, unit_id: &str) {
        if self.infeasible_units.len() < INFEASIBLE_RECORD_LIMIT {
            self.infeasible_units.push(unit_id.to_string());
        }
    }

    fn insert_no_preemptable(&mut self, unit_id: &str) {
        if self.no_preemptable_units.len() < INFEASIBLE_RECORD_LIMIT {
            self.no_preemptable_units.push(unit_id.to_string());
        }
    }

    fn log(&self, candidate: &InstanceInfo) {
        if !self.infeasible_units.is_empty() || !self.no_preemptable_units.is_empty() {
            info!(
                "{}|preempt decision for instance({}): infeasible units {:?}, units without preemptable victims {:?}",
                candidate.request_id,
                candidate.instance_id,
                self.infeasible_units,
                self.no_preemptable_units
            );
        }
    }
}

#[derive(Debug, Default)]
pub struct PreemptionController;

impl PreemptionController {
    pub fn new() -> Self {
        Default::default()
    }

    /// Computes the best unit/victim set for a candidate no free capacity
    /// satisfies. Returns `NoPreemptableInstance` when no unit yields a
    /// viable set.
    pub fn preempt_decision(
        &self,
        ctx: &PreAllocatedContext,
        candidate: &InstanceInfo,
        view: &ResourceViewInfo,
    ) -> Result<PreemptResult, Status> {
        let mut feasible: Vec<PreemptableUnit> = Vec::new();
        let mut infeasible_ctx = InfeasibleContext::default();

        for unit in &view.units {
            if !Self::unit_meets_capacity(ctx, candidate, unit) {
                infeasible_ctx.insert_infeasible(&unit.unit_id);
                continue;
            }
            let mut score = 0;
            if !Self::resource_affinity_met(ctx, candidate, unit, &mut score) {
                infeasible_ctx.insert_infeasible(&unit.unit_id);
                continue;
            }
            match Self::choose_victims(ctx, candidate, unit, score) {
                Some(preemptable) => feasible.push(preemptable),
                None => infeasible_ctx.insert_no_preemptable(&unit.unit_id),
            }
        }
        infeasible_ctx.log(candidate);

        if feasible.is_empty() {
            warn!(
                "{}|no available instance to be preempted for ({})",
                candidate.request_id, candidate.instance_id
            );
            return Err(Status::new(
                StatusCode::NoPreemptableInstance,
                format!("no preemptable instance for {}", candidate.instance_id),
            ));
        }
        feasible.sort_by(compare_preemptable_units);
        let best = feasible.swap_remove(0);
        info!(
            "{}|preempt decision for instance({}): unit({}) score({}) victims({})",
            candidate.request_id,
            candidate.instance_id,
            best.unit_id,
            best.score,
            best.victims.len()
        );
        Ok(PreemptResult {
            unit_id: best.unit_id,
            owner_id: best.owner_id,
            victims: best.victims,
        })
    }

    /// Total capacity (minus this pass's reservations) must cover the
    /// candidate even before victims are chosen; otherwise the unit can
    /// never fit it.
    fn unit_meets_capacity(
        ctx: &PreAllocatedContext,
        candidate: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> bool {
        let cap = ctx.remaining_of(&unit.unit_id, &unit.capacity);
        candidate.resources.fits_within(&cap)
    }

    /// Resource-scope affinity gate: hard required filters on the unit's
    /// static labels, then the priority-aware score (−1 disqualifies).
    fn resource_affinity_met(
        ctx: &PreAllocatedContext,
        candidate: &InstanceInfo,
        unit: &ResourceUnit,
        score: &mut i64,
    ) -> bool {
        let aff = &candidate.schedule_options.affinity;
        if !affinity::resource_required_passed(aff, &unit.node_labels) {
            return false;
        }
        *score = affinity::resource_affinity_score(aff, &unit.node_labels);
        if *score == REQUIRED_AFFINITY_PRIORITY_NOT_MET {
            return false;
        }
        // The resource-scope required anti-affinity is enforced against the
        // unit's labels including this pass's tentative contributions.
        let unit_labels = ctx.labels_of(&unit.unit_id, &unit.node_labels);
        if let Some(resource) = &aff.resource {
            if let Some(required_anti) = &resource.required_anti {
                if !required_anti.order_priority && !required_anti_filter(required_anti, &unit_labels)
                {
                    return false;
                }
            }
        }
        true
    }

    /// Victim-candidate rule: the owner allowed preemption, the candidate
    /// outranks the victim, and (when the candidate carries an instance
    /// required-affinity) the victim's own labels satisfy it.
    fn is_preemptable(candidate: &InstanceInfo, victim: &InstanceInfo) -> bool {
        if !victim.schedule_options.preempted_allowed {
            return false;
        }
        if candidate.priority() <= victim.priority() {
            return false;
        }
        let aff = &candidate.schedule_options.affinity;
        if let Some(instance) = &aff.instance {
            if let Some(required) = &instance.required {
                return required_filter(required, &LabelSet::from_labels(&victim.labels));
            }
        }
        true
    }

    /// Greedily accumulates victims (in victim order) until the freed
    /// resources cover the candidate, then re-validates the instance-scope
    /// affinity against the unit's labels with the victims removed.
    fn choose_victims(
        ctx: &PreAllocatedContext,
        candidate: &InstanceInfo,
        unit: &ResourceUnit,
        base_score: i64,
    ) -> Option<PreemptableUnit> {
        let mut victim_candidates: Vec<&InstanceInfo> = unit
            .instances
            .values()
            .filter(|victim| Self::is_preemptable(candidate, victim))
            .collect();
        if victim_candidates.is_empty() {
            return None;
        }
        victim_candidates.sort_by(|l, r| compare_victims(candidate, l, r));

        let mut avail = ctx.remaining_of(&unit.unit_id, &unit.allocatable);
        let mut unit_labels = ctx.labels_of(&unit.unit_id, &unit.node_labels);
        let mut victims = Vec::new();
        let mut preempted_resources = Resources::default();
        for victim in victim_candidates {
            avail = avail + &victim.resources;
            unit_labels.subtract(&LabelSet::from_labels(&victim.labels));
            preempted_resources = preempted_resources + &victim.resources;
            victims.push(victim.clone());
            if candidate.resources.fits_within(&avail) {
                break;
            }
        }
        if !candidate.resources.fits_within(&avail) {
            warn!(
                "{}|all preemptable instances cannot meet resource requirement ({})",
                candidate.request_id, candidate.instance_id
            );
            return None;
        }

        // Instance-scope affinity is judged on the unit as it would look
        // after the eviction: a required anti-affinity anchored on a victim
        // is satisfied by removing it, one anchored on the unit itself is a
        // hard failure.
        let aff = &candidate.schedule_options.affinity;
        if let Some(instance) = &aff.instance {
            if let Some(required_anti) = &instance.required_anti {
                if !required_anti.order_priority && !required_anti_filter(required_anti, &unit_labels)
                {
                    return None;
                }
            }
            if let Some(required) = &instance.required {
                if !required.order_priority && !required_filter(required, &unit_labels) {
                    return None;
                }
            }
        }
        let instance_score = affinity::instance_affinity_score(aff, &unit_labels);
        if instance_score == REQUIRED_AFFINITY_PRIORITY_NOT_MET {
            return None;
        }

        Some(PreemptableUnit {
            unit_id: unit.unit_id.clone(),
            owner_id: unit.owner_id.clone(),
            score: base_score + instance_score,
            victims,
            preempted_resources,
        })
    }
}
