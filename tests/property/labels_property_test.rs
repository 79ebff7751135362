// tests/property/labels_property_test.rs

//! Properties of the label multiset algebra.

use proptest::prelude::*;
use stratus::core::resources::LabelSet;

fn arb_labels() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,4}(=[a-z]{1,4})?", 0..12)
}

proptest! {
    #[test]
    fn merge_then_subtract_is_identity(base in arb_labels(), added in arb_labels()) {
        let base_set = LabelSet::from_labels(&base);
        let added_set = LabelSet::from_labels(&added);
        let mut combined = base_set.clone();
        combined.merge(&added_set);
        combined.subtract(&added_set);
        prop_assert_eq!(combined, base_set);
    }

    #[test]
    fn union_contains_both_operands_keys(a in arb_labels(), b in arb_labels()) {
        let sa = LabelSet::from_labels(&a);
        let sb = LabelSet::from_labels(&b);
        let union = sa.union(&sb);
        for key in sa.keys() {
            prop_assert!(union.contains_key(key));
        }
        for key in sb.keys() {
            prop_assert!(union.contains_key(key));
        }
    }

    #[test]
    fn difference_never_grows(a in arb_labels(), b in arb_labels()) {
        let sa = LabelSet::from_labels(&a);
        let sb = LabelSet::from_labels(&b);
        let diff = sa.difference(&sb);
        for key in diff.keys() {
            prop_assert!(sa.contains_key(key));
        }
    }
}
