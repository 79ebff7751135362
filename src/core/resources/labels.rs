// src/core/resources/labels.rs

//! Label multisets. A resource unit's label view is the multiset union of
//! its static base labels and the labels contributed by every placed
//! instance, so that removing an instance removes exactly its contribution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A multiset of labels: key → (value → count). An instance label written
/// as `"key=value"` contributes that pair; a bare `"key"` contributes the
/// empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet {
    entries: BTreeMap<String, BTreeMap<String, u32>>,
}

/// Splits an instance label into its key/value pair.
fn split_label(label: &str) -> (&str, &str) {
    match label.split_once('=') {
        Some((k, v)) => (k, v),
        None => (label, ""),
    }
}

impl LabelSet {
    pub fn new() -> Self {
        Default::default()
    }

    /// Builds a label set from instance-style label strings, each counted once.
    pub fn from_labels<S: AsRef<str>>(labels: impl IntoIterator<Item = S>) -> Self {
        let mut set = LabelSet::new();
        for label in labels {
            set.add_label(label.as_ref());
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether any of `values` is present under `key`.
    pub fn key_has_any_value(&self, key: &str, values: &[String]) -> bool {
        match self.entries.get(key) {
            Some(counted) => values.iter().any(|v| counted.contains_key(v.as_str())),
            None => false,
        }
    }

    pub fn add_label(&mut self, label: &str) {
        let (key, value) = split_label(label);
        *self
            .entries
            .entry(key.to_string())
            .or_default()
            .entry(value.to_string())
            .or_insert(0) += 1;
    }

    pub fn remove_label(&mut self, label: &str) {
        let (key, value) = split_label(label);
        if let Some(counted) = self.entries.get_mut(key) {
            if let Some(count) = counted.get_mut(value) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counted.remove(value);
                }
            }
            if counted.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Multiset union with another label set.
    pub fn merge(&mut self, other: &LabelSet) {
        for (key, counted) in &other.entries {
            let entry = self.entries.entry(key.clone()).or_default();
            for (value, count) in counted {
                *entry.entry(value.clone()).or_insert(0) += count;
            }
        }
    }

    /// Multiset subtraction of another label set.
    pub fn subtract(&mut self, other: &LabelSet) {
        for (key, counted) in &other.entries {
            if let Some(entry) = self.entries.get_mut(key) {
                for (value, count) in counted {
                    if let Some(current) = entry.get_mut(value) {
                        *current = current.saturating_sub(*count);
                        if *current == 0 {
                            entry.remove(value);
                        }
                    }
                }
                if entry.is_empty() {
                    self.entries.remove(key);
                }
            }
        }
    }

    /// Returns the union of self and `other` without mutating either.
    pub fn union(&self, other: &LabelSet) -> LabelSet {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    /// Returns self minus `other` without mutating either.
    pub fn difference(&self, other: &LabelSet) -> LabelSet {
        let mut reduced = self.clone();
        reduced.subtract(other);
        reduced
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}
