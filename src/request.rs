//! Validated request payloads.
//!
//! Callers hand these to the [`crate::scheduler::Scheduler`]; every field is
//! typed, and `validate` runs before anything reaches the stores.

use serde::Deserialize;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::*;

fn default_true() -> bool {
    true
}

pub fn validate_subject(subject: &str) -> Result<(), EngineError> {
    if subject.trim().is_empty() {
        return Err(EngineError::InvalidRequest("subject id is empty".into()));
    }
    if subject.len() > MAX_SUBJECT_ID_LEN {
        return Err(EngineError::LimitExceeded("subject id too long"));
    }
    Ok(())
}

pub fn validate_timestamp(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

fn validate_title(title: Option<&str>) -> Result<(), EngineError> {
    if title.is_some_and(|t| t.len() > MAX_TITLE_LEN) {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(())
}

fn validate_day(day: u8) -> Result<(), EngineError> {
    if day > 6 {
        return Err(EngineError::InvalidRequest(format!(
            "day_of_week must be 0-6 (Sunday = 0), got {day}"
        )));
    }
    Ok(())
}

fn validate_slot_length(len: u32) -> Result<(), EngineError> {
    if len == 0 || len > MAX_SLOT_LENGTH_MINUTES {
        return Err(EngineError::InvalidRequest(format!(
            "slot_length_minutes must be between 1 and {MAX_SLOT_LENGTH_MINUTES}, got {len}"
        )));
    }
    Ok(())
}

// ── Rules ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleRequest {
    pub day_of_week: u8,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub slot_length_minutes: u32,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub title: Option<String>,
}

impl RuleRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_day(self.day_of_week)?;
        if self.end_time <= self.start_time {
            return Err(EngineError::InvalidRule(format!(
                "end_time {} must be after start_time {}",
                self.end_time, self.start_time
            )));
        }
        validate_slot_length(self.slot_length_minutes)?;
        validate_title(self.title.as_deref())
    }

    pub fn into_rule(self, subject: &str, now: Ms) -> AvailabilityRule {
        AvailabilityRule {
            id: ulid::Ulid::new(),
            subject_id: subject.to_string(),
            day_of_week: self.day_of_week,
            start_time: self.start_time,
            end_time: self.end_time,
            slot_length_minutes: self.slot_length_minutes,
            available: self.available,
            title: self.title,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field-level checks on a patch. Whether the patched rule still has
/// `end > start` is checked against the stored rule.
pub fn validate_patch(patch: &RulePatch) -> Result<(), EngineError> {
    if let Some(day) = patch.day_of_week {
        validate_day(day)?;
    }
    if let Some(len) = patch.slot_length_minutes {
        validate_slot_length(len)?;
    }
    if let (Some(start), Some(end)) = (patch.start_time, patch.end_time)
        && end <= start
    {
        return Err(EngineError::InvalidRule(format!(
            "end_time {end} must be after start_time {start}"
        )));
    }
    validate_title(patch.title.as_deref())
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BookingRequest {
    pub contact: String,
    pub start_at: Ms,
    pub end_at: Ms,
    #[serde(flatten)]
    pub meta: BookingMeta,
}

impl BookingRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.start_at >= self.end_at {
            return Err(EngineError::BadRange);
        }
        validate_timestamp(self.start_at)?;
        validate_timestamp(self.end_at)?;
        if self.contact.trim().is_empty() {
            return Err(EngineError::InvalidRequest("contact is required".into()));
        }
        if self.contact.len() > MAX_CONTACT_LEN {
            return Err(EngineError::LimitExceeded("contact too long"));
        }
        if self
            .meta
            .fields()
            .iter()
            .flatten()
            .any(|f| f.len() > MAX_META_FIELD_LEN)
        {
            return Err(EngineError::LimitExceeded("booking field too long"));
        }
        Ok(())
    }

    pub fn slot(&self) -> Slot {
        Slot::new(self.start_at, self.end_at)
    }
}

/// A half-open `[from, to)` query range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeQuery {
    pub from: Ms,
    pub to: Ms,
}

impl RangeQuery {
    pub fn new(from: Ms, to: Ms) -> Self {
        Self { from, to }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.from >= self.to {
            return Err(EngineError::BadRange);
        }
        validate_timestamp(self.from)?;
        validate_timestamp(self.to)
    }
}
