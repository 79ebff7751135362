// src/core/resources/mod.rs

//! The cluster resource model: resource demand arithmetic, label multisets,
//! affinity selectors, resource units, and the aggregated resource view
//! consumed by the scheduler.

pub mod affinity;
pub mod demand;
pub mod labels;
pub mod unit;
pub mod view;

pub use affinity::{Affinity, LabelExpression, LabelOperator, Selector, SelectorSet, SubCondition};
pub use demand::Resources;
pub use labels::LabelSet;
pub use unit::ResourceUnit;
pub use view::{ResourceView, ResourceViewInfo};
