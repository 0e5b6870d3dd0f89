use std::collections::HashSet;

use crate::model::*;

use super::EngineError;

// ── Slot expansion ────────────────────────────────────────────────

/// Re-check a rule's data invariants.
pub fn check_rule(rule: &AvailabilityRule) -> Result<(), EngineError> {
    if rule.day_of_week > 6 {
        return Err(EngineError::InvalidRule(format!(
            "day_of_week {} out of range 0-6 for rule {}",
            rule.day_of_week, rule.id
        )));
    }
    if rule.end_time <= rule.start_time {
        return Err(EngineError::InvalidRule(format!(
            "end_time must be after start_time for rule {}",
            rule.id
        )));
    }
    if rule.slot_length_minutes == 0 {
        return Err(EngineError::InvalidRule(format!(
            "slot_length_minutes must be positive for rule {}",
            rule.id
        )));
    }
    Ok(())
}

/// Expand weekly rules into candidate slots intersecting `[from, to)`.
///
/// Every calendar day from `floor_day(from)` through `floor_day(to)` is visited.
/// Each matching rule's window is cut into consecutive `slot_length` chunks; a
/// trailing chunk shorter than the slot length is dropped. A chunk is emitted
/// when it overlaps the query (half-open on both sides) and the rule is
/// available. Unavailable rules emit nothing and do not subtract from others.
///
/// Overlapping rules are not merged: identical candidates from two rules are
/// both returned. Output is sorted by start; ties keep rule order.
pub fn expand(rules: &[AvailabilityRule], from: Ms, to: Ms) -> Result<Vec<Slot>, EngineError> {
    if from >= to {
        return Err(EngineError::BadRange);
    }
    let query = Span::new(from, to);
    let last_day = floor_day(to);

    let mut slots = Vec::new();
    let mut day = floor_day(from);
    while day <= last_day {
        let dow = weekday(day);
        for rule in rules.iter().filter(|r| r.day_of_week == dow) {
            check_rule(rule)?;
            if !rule.available {
                continue;
            }
            let (window_start, window_end) = rule.window_on(day);
            let len = rule.slot_length_ms();
            let mut start = window_start;
            while start + len <= window_end {
                let slot = Slot::new(start, start + len);
                if slot.span().overlaps(&query) {
                    slots.push(slot);
                }
                start += len;
            }
        }
        day += DAY_MS;
    }

    slots.sort_by_key(|s| s.start_at);
    Ok(slots)
}

/// Drop every candidate whose start equals a booked start.
///
/// Matching is by exact start instant only; a booking at an unaligned offset
/// does not hide the candidate it overlaps.
pub fn subtract_booked(candidates: Vec<Slot>, booked_starts: &HashSet<Ms>) -> Vec<Slot> {
    if booked_starts.is_empty() {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|s| !booked_starts.contains(&s.start_at))
        .collect()
}

/// True if some candidate is exactly `[start, end)`.
pub fn contains_exact(candidates: &[Slot], start: Ms, end: Ms) -> bool {
    candidates
        .iter()
        .any(|s| s.start_at == start && s.end_at == end)
}
