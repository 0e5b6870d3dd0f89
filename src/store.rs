//! Persistence contract the scheduler is written against.
//!
//! Both traits describe a transactional store: every mutating call either
//! applies completely or leaves no trace. [`crate::engine::Engine`] is the
//! WAL-backed implementation shipped with this crate.

use async_trait::async_trait;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Persist new rules for one subject, all or nothing.
    ///
    /// With `unique_per_day`, a rule whose day already has a rule for this
    /// subject (stored or earlier in the batch) fails with `AlreadyExists`.
    async fn insert_rules(
        &self,
        subject: &str,
        rules: Vec<AvailabilityRule>,
        unique_per_day: bool,
    ) -> Result<Vec<AvailabilityRule>, EngineError>;

    /// All rules of a subject, in insertion order.
    async fn list_rules(&self, subject: &str) -> Result<Vec<AvailabilityRule>, EngineError>;

    /// Apply `patch` to one of the subject's rules. A rule owned by another
    /// subject is `NotFound`.
    ///
    /// With `unique_per_day`, moving the rule onto a day another of the
    /// subject's rules already uses fails with `AlreadyExists`.
    async fn update_rule(
        &self,
        subject: &str,
        rule_id: Ulid,
        patch: &RulePatch,
        unique_per_day: bool,
    ) -> Result<AvailabilityRule, EngineError>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Bookings with `from <= start_at < to`, optionally restricted to one
    /// status, ordered by start.
    async fn list_in_range(
        &self,
        subject: &str,
        from: Ms,
        to: Ms,
        status: Option<BookingStatus>,
    ) -> Result<Vec<Booking>, EngineError>;

    /// Every booking of a subject, any status, ordered by start.
    async fn list_all(&self, subject: &str) -> Result<Vec<Booking>, EngineError>;

    /// Insert a confirmed booking for `slot` unless a confirmed booking
    /// already starts at `slot.start_at` (`SlotTaken`).
    ///
    /// Concurrent calls for the same subject and start: exactly one wins.
    async fn reserve(
        &self,
        subject: &str,
        contact: String,
        slot: Slot,
        meta: BookingMeta,
    ) -> Result<Booking, EngineError>;

    /// Move a booking from confirmed to cancelled.
    async fn cancel(&self, booking_id: Ulid) -> Result<Booking, EngineError>;
}
