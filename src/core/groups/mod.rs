// src/core/groups/mod.rs

//! The instance-group manager: lifecycle coupling, failure propagation, and
//! kill coordination for groups of instances, run as a leader-elected actor
//! with a master/slave business policy.

pub mod cache;
pub mod manager;

pub use cache::GroupCaches;
pub use manager::{
    group_key, GroupCommand, GroupInfo, GroupManagerActor, GroupManagerHandle, GroupState,
    NoopScheduleControl, Role, ScheduleControl, GROUP_MANAGER_OWNER,
};
