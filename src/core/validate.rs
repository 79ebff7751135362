// src/core/validate.rs

//! Request validation shared by the client runtime (fail fast) and the
//! server edge (never trust the wire).

use crate::core::errors::StratusError;
use once_cell::sync::Lazy;
use regex::Regex;

/// Labels: 1–63 chars of `[a-zA-Z0-9-]`, not starting or ending with `-`.
static LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").unwrap());

pub const MAX_FUNCTION_NAME_LEN: usize = 64;
pub const MIN_CONCURRENCY: u32 = 1;
pub const MAX_CONCURRENCY: u32 = 1000;

/// Validates one instance label; `key=value` labels are validated per part.
pub fn validate_label(label: &str) -> Result<(), StratusError> {
    let (key, value) = match label.split_once('=') {
        Some((k, v)) => (k, Some(v)),
        None => (label, None),
    };
    if !LABEL_RE.is_match(key) {
        return Err(StratusError::Parameter(format!(
            "invalid label key {key:?}: must match [a-zA-Z0-9-]{{1,63}} without leading/trailing '-'"
        )));
    }
    if let Some(value) = value {
        if !LABEL_RE.is_match(value) {
            return Err(StratusError::Parameter(format!(
                "invalid label value {value:?} for key {key:?}"
            )));
        }
    }
    Ok(())
}

pub fn validate_labels<S: AsRef<str>>(labels: &[S]) -> Result<(), StratusError> {
    for label in labels {
        validate_label(label.as_ref())?;
    }
    Ok(())
}

pub fn validate_concurrency(concurrency: u32) -> Result<(), StratusError> {
    if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
        return Err(StratusError::Parameter(format!(
            "concurrency {concurrency} outside [{MIN_CONCURRENCY}, {MAX_CONCURRENCY}]"
        )));
    }
    Ok(())
}

pub fn validate_function_name(name: &str) -> Result<(), StratusError> {
    if name.is_empty() {
        return Err(StratusError::Parameter("function name is empty".into()));
    }
    if name.len() > MAX_FUNCTION_NAME_LEN {
        return Err(StratusError::Parameter(format!(
            "function name length {} exceeds {MAX_FUNCTION_NAME_LEN}",
            name.len()
        )));
    }
    Ok(())
}
