//! Condition machine
//!
//! Pure functions over a condition list. `LastTransitionTime` moves only when
//! a condition's status changes; reason and message may change freely.
//! Callers own persistence and must operate on a clone of any cached object.

use chrono::{DateTime, Utc};

use crate::crd::{Condition, ConditionStatus, ConditionType};

/// Set or merge a condition of `type_`
///
/// Appends when absent. Replaces in place when present, keeping the
/// existing transition time unless the status changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        None => conditions.push(Condition::new(type_, status, reason, message, now)),
    }
}

/// The condition of `type_`, if present
pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True when a condition of `type_` exists with status `True`
pub fn is_condition_true(conditions: &[Condition], type_: ConditionType) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Shorthand for the Ready condition being true
pub fn is_ready(conditions: &[Condition]) -> bool {
    is_condition_true(conditions, ConditionType::Ready)
}

/// Shorthand for the Failed condition being true
pub fn is_failed(conditions: &[Condition]) -> bool {
    is_condition_true(conditions, ConditionType::Failed)
}
