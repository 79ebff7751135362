// src/core/scheduler/performer.rs

//! Placement performers: the pure algorithms that map one queue item onto
//! resource units, reserving against the pre-allocated context. The
//! scheduler loop stays free of placement detail; the server applies the
//! returned placements to the authoritative view.

use super::context::PreAllocatedContext;
use super::item::{GroupScheduleItem, InstanceItem, Placement, ScheduleResult};
use super::preemption::PreemptionController;
use crate::core::errors::{Status, StatusCode};
use crate::core::instances::InstanceInfo;
use crate::core::resources::affinity::{
    self, required_anti_filter, required_filter, REQUIRED_AFFINITY_PRIORITY_NOT_MET,
};
use crate::core::resources::view::ResourceViewInfo;
use crate::core::resources::{LabelSet, ResourceUnit, SelectorSet};
use tracing::{debug, info};

/// The seam between the scheduler loop and the placement algorithm.
pub trait SchedulePerformer: Send + Sync {
    /// Attempts to place one instance, reserving into `ctx` on success.
    fn schedule_instance(
        &self,
        ctx: &mut PreAllocatedContext,
        view: &ResourceViewInfo,
        item: &InstanceItem,
    ) -> ScheduleResult;

    /// Attempts to place a whole group; all members or none.
    fn schedule_group(
        &self,
        ctx: &mut PreAllocatedContext,
        view: &ResourceViewInfo,
        item: &GroupScheduleItem,
    ) -> ScheduleResult;

    /// Releases the reservations a completed-but-discarded schedule made.
    fn roll_back(&self, ctx: &mut PreAllocatedContext, result: &ScheduleResult);
}

#[derive(Default)]
pub struct InstancePerformer {
    preemption: PreemptionController,
}

impl InstancePerformer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Hard affinity gates for one unit, instance and resource scope alike.
    fn unit_passes_required(
        candidate: &InstanceInfo,
        unit_labels: &LabelSet,
    ) -> bool {
        let aff = &candidate.schedule_options.affinity;
        if !affinity::resource_required_passed(aff, unit_labels) {
            return false;
        }
        if let Some(instance) = &aff.instance {
            if let Some(required) = &instance.required {
                if !required.order_priority && !required_filter(required, unit_labels) {
                    return false;
                }
            }
            if let Some(required_anti) = &instance.required_anti {
                if !required_anti.order_priority && !required_anti_filter(required_anti, unit_labels)
                {
                    return false;
                }
            }
        }
        true
    }

    /// Whether placing on this unit would consume capacity a parked pending
    /// request is waiting for.
    fn conflicts_with_pending(pending: &[SelectorSet], unit_labels: &LabelSet) -> bool {
        pending.iter().any(|set| {
            set.required
                .as_ref()
                .is_some_and(|sel| sel.matches(unit_labels))
        })
    }

    /// Core single-instance placement. On success the reservation is
    /// recorded in `ctx` and the placement returned.
    fn place_one(
        &self,
        ctx: &mut PreAllocatedContext,
        view: &ResourceViewInfo,
        candidate: &InstanceInfo,
        pending: &[SelectorSet],
    ) -> Result<Placement, Status> {
        let mut scored: Vec<(&ResourceUnit, i64, LabelSet)> = Vec::new();
        let mut capacity_rejections = 0usize;
        let mut affinity_rejections = 0usize;

        for unit in &view.units {
            if let Some(rgroup) = &candidate.schedule_options.resource_group {
                if unit.resource_group.as_deref() != Some(rgroup.as_str()) {
                    continue;
                }
            }
            let unit_labels = ctx.labels_of(&unit.unit_id, &unit.node_labels);
            if !Self::unit_passes_required(candidate, &unit_labels) {
                affinity_rejections += 1;
                continue;
            }
            let resource_score =
                affinity::resource_affinity_score(&candidate.schedule_options.affinity, &unit_labels);
            let instance_score =
                affinity::instance_affinity_score(&candidate.schedule_options.affinity, &unit_labels);
            if resource_score == REQUIRED_AFFINITY_PRIORITY_NOT_MET
                || instance_score == REQUIRED_AFFINITY_PRIORITY_NOT_MET
            {
                affinity_rejections += 1;
                continue;
            }
            let avail = ctx.remaining_of(&unit.unit_id, &unit.allocatable);
            if !candidate.resources.fits_within(&avail) {
                capacity_rejections += 1;
                continue;
            }
            scored.push((unit, resource_score + instance_score, unit_labels));
        }

        // Prefer units that leave parked pending requests something to land
        // on; fall back to the full candidate set when none remain.
        if !pending.is_empty() {
            let non_conflicting: Vec<_> = scored
                .iter()
                .filter(|(_, _, labels)| !Self::conflicts_with_pending(pending, labels))
                .cloned()
                .collect();
            if !non_conflicting.is_empty() {
                scored = non_conflicting;
            }
        }

        if let Some((unit, score, _)) = scored
            .into_iter()
            .max_by(|(lu, ls, _), (ru, rs, _)| ls.cmp(rs).then(ru.unit_id.cmp(&lu.unit_id)))
        {
            debug!(
                "{}|place instance({}) on unit({}) score({})",
                candidate.request_id, candidate.instance_id, unit.unit_id, score
            );
            let labels = LabelSet::from_labels(&candidate.labels);
            ctx.reserve(&unit.unit_id, &candidate.resources, &labels);
            return Ok(Placement {
                instance_id: candidate.instance_id.clone(),
                unit_id: unit.unit_id.clone(),
                owner_id: unit.owner_id.clone(),
                resources: candidate.resources.clone(),
                labels: candidate.labels.clone(),
                evicted: Vec::new(),
            });
        }

        if capacity_rejections > 0 {
            // Capacity was the blocker somewhere: try preempting.
            match self.preemption.preempt_decision(ctx, candidate, view) {
                Ok(preempt) => {
                    info!(
                        "{}|instance({}) placed on unit({}) by preempting {} instance(s)",
                        candidate.request_id,
                        candidate.instance_id,
                        preempt.unit_id,
                        preempt.victims.len()
                    );
                    let labels = LabelSet::from_labels(&candidate.labels);
                    ctx.reserve(&preempt.unit_id, &candidate.resources, &labels);
                    return Ok(Placement {
                        instance_id: candidate.instance_id.clone(),
                        unit_id: preempt.unit_id,
                        owner_id: preempt.owner_id,
                        resources: candidate.resources.clone(),
                        labels: candidate.labels.clone(),
                        evicted: preempt.victims,
                    });
                }
                Err(status) => {
                    return Err(Status::new(
                        StatusCode::ResourceNotEnough,
                        format!(
                            "no unit fits instance {} ({} capacity, {} affinity rejections)",
                            candidate.instance_id, capacity_rejections, affinity_rejections
                        ),
                    )
                    .with_detail(status.message));
                }
            }
        }
        Err(Status::new(
            StatusCode::AffinityScheduleFailed,
            format!(
                "no unit satisfies the affinity of instance {} ({} units rejected)",
                candidate.instance_id, affinity_rejections
            ),
        ))
    }

}

impl SchedulePerformer for InstancePerformer {
    fn schedule_instance(
        &self,
        ctx: &mut PreAllocatedContext,
        view: &ResourceViewInfo,
        item: &InstanceItem,
    ) -> ScheduleResult {
        let pending = item.pending_affinity.lock().clone();
        match self.place_one(ctx, view, &item.instance, &pending) {
            Ok(placement) => ScheduleResult::success(vec![placement]),
            Err(status) => ScheduleResult::failure(status.code, status.message),
        }
    }

    fn schedule_group(
        &self,
        ctx: &mut PreAllocatedContext,
        view: &ResourceViewInfo,
        item: &GroupScheduleItem,
    ) -> ScheduleResult {
        let mut placements: Vec<Placement> = Vec::new();
        for member in &item.members {
            let pending = member.pending_affinity.lock().clone();
            match self.place_one(ctx, view, &member.instance, &pending) {
                Ok(placement) => placements.push(placement),
                Err(status) => {
                    // All-or-nothing: release what this group reserved.
                    let partial = ScheduleResult::success(placements);
                    self.roll_back(ctx, &partial);
                    let code = if status.code == StatusCode::AffinityScheduleFailed {
                        StatusCode::AffinityScheduleFailed
                    } else {
                        StatusCode::ResourceNotEnough
                    };
                    return ScheduleResult::failure(
                        code,
                        format!(
                            "group {} member {} unschedulable: {}",
                            item.group_id, member.instance.instance_id, status.message
                        ),
                    );
                }
            }
        }
        ScheduleResult::success(placements)
    }

    fn roll_back(&self, ctx: &mut PreAllocatedContext, result: &ScheduleResult) {
        for placement in &result.placements {
            let labels = LabelSet::from_labels(&placement.labels);
            ctx.release(&placement.unit_id, &placement.resources, &labels);
        }
    }
}
