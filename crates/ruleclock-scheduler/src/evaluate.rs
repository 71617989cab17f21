//! Pure matching of conditions against a wall-clock minute.
//!
//! Interval phase: a trigger interval is anchored to the rule's activation
//! minute when one is given, otherwise to midnight. Filter intervals are
//! always midnight-anchored. [`crate::next`] uses the same phase so "does it
//! fire now" and "when does it fire next" never disagree.

use crate::types::{
    Condition, FilterCondition, LogicalOperator, RangeCondition, SpecificTime, TimeCondition,
    TriggerCondition, WallTime, MINUTES_PER_DAY,
};

/// Evaluate a condition tree at `at`. Compound nodes short-circuit.
pub fn evaluate(condition: &Condition, at: WallTime) -> bool {
    match condition {
        Condition::Time(t) => evaluate_time(t, at),
        Condition::Compound(c) => match c.operator {
            LogicalOperator::And => c.conditions.iter().all(|child| evaluate(child, at)),
            LogicalOperator::Or => c.conditions.iter().any(|child| evaluate(child, at)),
        },
    }
}

/// Evaluate a leaf condition at `at` with midnight-anchored intervals.
pub fn evaluate_time(condition: &TimeCondition, at: WallTime) -> bool {
    match condition {
        TimeCondition::Range(r) => range_matches(r, at),
        TimeCondition::Interval(i) => interval_matches(i.interval_minutes, at, None),
        TimeCondition::Specific(s) => specific_matches(s, at),
    }
}

/// Evaluate a trigger at `at`, phasing intervals from `anchor` when present.
pub fn evaluate_trigger(trigger: &TriggerCondition, at: WallTime, anchor: Option<WallTime>) -> bool {
    match trigger {
        TriggerCondition::Interval(i) => interval_matches(i.interval_minutes, at, anchor),
        TriggerCondition::Specific(s) => specific_matches(s, at),
    }
}

/// True when every filter holds at `at`. An empty list holds vacuously.
pub fn filters_pass(filters: &[FilterCondition], at: WallTime) -> bool {
    filters.iter().all(|f| evaluate_time(f, at))
}

/// Should a rule with these conditions fire at `at`?
///
/// Filters gate triggers: if any filter fails the triggers are not consulted.
pub fn evaluate_rule(
    triggers: &[TriggerCondition],
    filters: &[FilterCondition],
    at: WallTime,
    anchor: Option<WallTime>,
) -> bool {
    if !filters_pass(filters, at) {
        return false;
    }
    triggers.iter().any(|t| evaluate_trigger(t, at, anchor))
}

pub(crate) fn range_matches(r: &RangeCondition, at: WallTime) -> bool {
    let m = at.minutes();
    let start = r.start().minutes();
    let end = r.end().minutes();
    if start <= end {
        start <= m && m <= end
    } else {
        // crosses midnight
        m >= start || m <= end
    }
}

/// Minutes elapsed since the last phase origin, counted within one day.
pub(crate) fn phase_offset(at: WallTime, anchor: Option<WallTime>) -> u16 {
    let origin = anchor.map(WallTime::minutes).unwrap_or(0);
    (at.minutes() + MINUTES_PER_DAY - origin) % MINUTES_PER_DAY
}

pub(crate) fn interval_matches(every: u16, at: WallTime, anchor: Option<WallTime>) -> bool {
    if every == 0 {
        return false;
    }
    phase_offset(at, anchor) % every == 0
}

pub(crate) fn specific_matches(s: &SpecificTime, at: WallTime) -> bool {
    match (s.hour, s.minute) {
        (Some(h), Some(m)) => at.hour == h && at.minute == m,
        (Some(h), None) => at.hour == h && at.minute == 0,
        (None, Some(m)) => at.minute == m,
        (None, None) => at.minute == 0,
    }
}
