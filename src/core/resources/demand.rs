// src/core/resources/demand.rs

//! Resource demand and capacity arithmetic. CPU is measured in millicores,
//! memory in megabytes; custom resources are a named vector of counts.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Sub};

/// A resource vector: scalar CPU and memory plus named custom resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: u64,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub custom: BTreeMap<String, u64>,
}

impl Resources {
    pub fn new(cpu: u64, memory: u64) -> Self {
        Resources {
            cpu,
            memory,
            custom: BTreeMap::new(),
        }
    }

    pub fn with_custom(mut self, name: impl Into<String>, amount: u64) -> Self {
        self.custom.insert(name.into(), amount);
        self
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory == 0 && self.custom.values().all(|v| *v == 0)
    }

    /// Whether this demand fits entirely within `avail`. Custom resources
    /// absent from `avail` count as zero.
    pub fn fits_within(&self, avail: &Resources) -> bool {
        if self.cpu > avail.cpu || self.memory > avail.memory {
            return false;
        }
        self.custom
            .iter()
            .all(|(name, amount)| *amount <= avail.custom.get(name).copied().unwrap_or(0))
    }

    /// Saturating element-wise subtraction.
    pub fn saturating_sub(&self, rhs: &Resources) -> Resources {
        let mut custom = self.custom.clone();
        for (name, amount) in &rhs.custom {
            let entry = custom.entry(name.clone()).or_insert(0);
            *entry = entry.saturating_sub(*amount);
        }
        Resources {
            cpu: self.cpu.saturating_sub(rhs.cpu),
            memory: self.memory.saturating_sub(rhs.memory),
            custom,
        }
    }

    /// A deterministic total order used by the preemption comparators:
    /// lexicographic over (cpu, memory, total custom amount).
    pub fn compare(&self, other: &Resources) -> Ordering {
        self.cpu
            .cmp(&other.cpu)
            .then(self.memory.cmp(&other.memory))
            .then(
                self.custom
                    .values()
                    .sum::<u64>()
                    .cmp(&other.custom.values().sum::<u64>()),
            )
    }
}

impl Add<&Resources> for Resources {
    type Output = Resources;

    fn add(mut self, rhs: &Resources) -> Resources {
        self.cpu += rhs.cpu;
        self.memory += rhs.memory;
        for (name, amount) in &rhs.custom {
            *self.custom.entry(name.clone()).or_insert(0) += amount;
        }
        self
    }
}

impl Sub<&Resources> for Resources {
    type Output = Resources;

    fn sub(self, rhs: &Resources) -> Resources {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} mem={}", self.cpu, self.memory)?;
        for (name, amount) in &self.custom {
            write!(f, " {name}={amount}")?;
        }
        Ok(())
    }
}
