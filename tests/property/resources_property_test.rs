// tests/property/resources_property_test.rs

//! Properties of resource arithmetic and the unit allocatable invariant.

use proptest::prelude::*;
use stratus::core::instances::{InstanceInfo, InstanceState};
use stratus::core::resources::{ResourceUnit, Resources};

fn arb_resources() -> impl Strategy<Value = Resources> {
    (0u64..10_000, 0u64..10_000).prop_map(|(cpu, memory)| Resources::new(cpu, memory))
}

fn instance(index: usize, resources: Resources) -> InstanceInfo {
    InstanceInfo {
        instance_id: format!("i{index}"),
        request_id: format!("r{index}"),
        resources,
        state: InstanceState::Running,
        ..Default::default()
    }
}

proptest! {
    #[test]
    fn add_then_sub_is_identity(a in arb_resources(), b in arb_resources()) {
        let sum = a.clone() + &b;
        let back = sum - &b;
        prop_assert_eq!(back, a);
    }

    #[test]
    fn fits_within_is_consistent_with_subtraction(a in arb_resources(), b in arb_resources()) {
        if a.fits_within(&b) {
            // Whatever fits leaves a remainder that adds back to the whole.
            let remainder = b.clone() - &a;
            prop_assert_eq!(remainder + &a, b);
        }
    }

    #[test]
    fn compare_is_a_total_order(a in arb_resources(), b in arb_resources()) {
        let ab = a.compare(&b);
        let ba = b.compare(&a);
        prop_assert_eq!(ab, ba.reverse());
        prop_assert_eq!(a.compare(&a), std::cmp::Ordering::Equal);
    }

    #[test]
    fn unit_allocatable_invariant_holds_under_place_and_evict(
        // Capacity always exceeds the worst-case total demand, so the
        // saturating arithmetic never clips.
        capacity in (100_000u64..500_000, 100_000u64..500_000),
        demands in prop::collection::vec(arb_resources(), 0..8),
        evict_mask in prop::collection::vec(any::<bool>(), 8),
    ) {
        let mut unit = ResourceUnit::new(
            "u1",
            "n1",
            Resources::new(capacity.0, capacity.1),
        );
        let instances: Vec<_> = demands
            .into_iter()
            .enumerate()
            .map(|(i, demand)| instance(i, demand))
            .collect();
        for info in &instances {
            unit.place(info.clone());
        }
        for (info, evict) in instances.iter().zip(evict_mask.iter()) {
            if *evict {
                unit.evict(&info.instance_id);
            }
        }
        // allocatable = capacity − Σ resources of the instances that remain.
        let (expected, _) = unit.recompute();
        prop_assert_eq!(unit.allocatable.clone(), expected);
    }
}
