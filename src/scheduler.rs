//! Free-slot computation and booking conflict resolution.
//!
//! A booking attempt moves through three phases:
//!
//! - **Validating**: the request is well formed and within limits.
//! - **Checking**: the requested window is re-derived from the subject's
//!   current rules. It must equal a candidate slot exactly.
//! - **Reserving**: the store inserts the booking under the subject's
//!   exclusive lock, or reports that the start is already taken.
//!
//! Nothing is retried; every rejection is returned to the caller as is.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::engine::{contains_exact, expand, now_ms, subtract_booked, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::request::{validate_patch, validate_subject, BookingRequest, RangeQuery, RuleRequest};
use crate::store::{BookingStore, RuleStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validating,
    Checking,
    Reserving,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Validating => "validating",
            Phase::Checking => "checking",
            Phase::Reserving => "reserving",
        })
    }
}

pub struct Scheduler<S> {
    store: Arc<S>,
    config: SchedulerConfig,
}

impl<S: RuleStore + BookingStore> Scheduler<S> {
    pub fn new(store: Arc<S>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    // ── Availability ─────────────────────────────────────────

    /// Add weekly rules for `subject`. The whole batch is validated first and
    /// stored atomically.
    pub async fn set_availability(
        &self,
        subject: &str,
        rules: Vec<RuleRequest>,
    ) -> Result<Vec<AvailabilityRule>, EngineError> {
        validate_subject(subject)?;
        if rules.len() > MAX_RULES_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many rules in one request"));
        }
        for rule in &rules {
            rule.validate()?;
        }
        let now = now_ms();
        let rules = rules
            .into_iter()
            .map(|r| r.into_rule(subject, now))
            .collect();
        let stored = self
            .store
            .insert_rules(subject, rules, self.config.unique_rule_per_day)
            .await?;
        tracing::info!("subject {subject}: stored {} availability rules", stored.len());
        Ok(stored)
    }

    pub async fn update_availability(
        &self,
        subject: &str,
        rule_id: Ulid,
        patch: RulePatch,
    ) -> Result<AvailabilityRule, EngineError> {
        validate_subject(subject)?;
        validate_patch(&patch)?;
        let rule = self
            .store
            .update_rule(subject, rule_id, &patch, self.config.unique_rule_per_day)
            .await?;
        tracing::info!("subject {subject}: rule {rule_id} updated");
        Ok(rule)
    }

    pub async fn list_availability(&self, subject: &str) -> Result<Vec<AvailabilityRule>, EngineError> {
        validate_subject(subject)?;
        self.store.list_rules(subject).await
    }

    /// Candidate slots in `[from, to)` minus those whose start is held by a
    /// confirmed booking.
    pub async fn get_free_slots(&self, subject: &str, from: Ms, to: Ms) -> Result<Vec<Slot>, EngineError> {
        validate_subject(subject)?;
        RangeQuery::new(from, to).validate()?;
        if to - from > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too large"));
        }

        let rules = self.store.list_rules(subject).await?;
        let candidates = expand(&rules, from, to)?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        // A negative pad would shrink the fetch below the query range.
        let pad = self.config.booking_pad_ms.max(0);
        let booked = self
            .store
            .list_in_range(
                subject,
                from.saturating_sub(pad),
                to.saturating_add(pad),
                Some(BookingStatus::Confirmed),
            )
            .await?;
        let starts: HashSet<Ms> = booked.iter().map(|b| b.start_at).collect();
        Ok(subtract_booked(candidates, &starts))
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Book one candidate slot.
    pub async fn create_booking(&self, subject: &str, request: BookingRequest) -> Result<Booking, EngineError> {
        let mut phase = Phase::Validating;
        let outcome = self.resolve(subject, request, &mut phase).await;
        match &outcome {
            Ok(booking) => tracing::info!(
                "subject {subject}: booking {} confirmed for [{}, {})",
                booking.id,
                booking.start_at,
                booking.end_at
            ),
            Err(EngineError::WalError(e)) => {
                tracing::error!("subject {subject}: booking failed while {phase}: {e}");
                observability::record_rejection("internal");
            }
            Err(e) => {
                tracing::debug!("subject {subject}: booking rejected while {phase}: {e}");
                observability::record_rejection(e.code());
            }
        }
        outcome
    }

    async fn resolve(
        &self,
        subject: &str,
        request: BookingRequest,
        phase: &mut Phase,
    ) -> Result<Booking, EngineError> {
        validate_subject(subject)?;
        request.validate()?;
        let slot = request.slot();

        *phase = Phase::Checking;
        // No rule yields a slot longer than the longest slot length.
        if slot.span().duration_ms() > MAX_SLOT_LENGTH_MINUTES as Ms * MINUTE_MS {
            return Err(EngineError::SlotNotAvailable);
        }
        let rules = self.store.list_rules(subject).await?;
        let candidates = expand(&rules, slot.start_at, slot.end_at)?;
        if !contains_exact(&candidates, slot.start_at, slot.end_at) {
            return Err(EngineError::SlotNotAvailable);
        }

        *phase = Phase::Reserving;
        self.store
            .reserve(subject, request.contact, slot, request.meta)
            .await
    }

    /// Bookings of `subject`: all of them when `range` is `None`, otherwise
    /// those starting in the range. Any status.
    pub async fn list_bookings(
        &self,
        subject: &str,
        range: Option<RangeQuery>,
    ) -> Result<Vec<Booking>, EngineError> {
        validate_subject(subject)?;
        match range {
            None => self.store.list_all(subject).await,
            Some(q) => {
                q.validate()?;
                self.store.list_in_range(subject, q.from, q.to, None).await
            }
        }
    }

    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.store.cancel(booking_id).await?;
        tracing::info!("subject {}: booking {booking_id} cancelled", booking.subject_id);
        Ok(booking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use std::path::PathBuf;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    // 2024-01-01T00:00:00Z, a Monday.
    const MONDAY: Ms = 1_704_067_200_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn scheduler(name: &str, config: SchedulerConfig) -> Scheduler<Engine> {
        let engine = Engine::open(test_wal_path(name)).unwrap();
        Scheduler::new(Arc::new(engine), config)
    }

    fn rule(day: u8, start: &str, end: &str, len: u32) -> RuleRequest {
        RuleRequest {
            day_of_week: day,
            start_time: start.parse().unwrap(),
            end_time: end.parse().unwrap(),
            slot_length_minutes: len,
            available: true,
            title: None,
        }
    }

    fn booking(start: Ms, end: Ms) -> BookingRequest {
        BookingRequest {
            contact: "bob@example.com".into(),
            start_at: start,
            end_at: end,
            meta: BookingMeta::default(),
        }
    }

    #[tokio::test]
    async fn monday_scenario() {
        let s = scheduler("monday.wal", SchedulerConfig::default());
        s.set_availability("alice", vec![rule(1, "09:00", "10:00", 30)])
            .await
            .unwrap();

        let free = s.get_free_slots("alice", MONDAY, MONDAY + 24 * H).await.unwrap();
        assert_eq!(
            free,
            vec![
                Slot::new(MONDAY + 9 * H, MONDAY + 9 * H + 30 * M),
                Slot::new(MONDAY + 9 * H + 30 * M, MONDAY + 10 * H),
            ]
        );

        let b = s
            .create_booking("alice", booking(MONDAY + 9 * H, MONDAY + 9 * H + 30 * M))
            .await
            .unwrap();
        assert_eq!(b.status, BookingStatus::Confirmed);

        let free = s.get_free_slots("alice", MONDAY, MONDAY + 24 * H).await.unwrap();
        assert_eq!(free, vec![Slot::new(MONDAY + 9 * H + 30 * M, MONDAY + 10 * H)]);

        // Cancelling frees the slot again.
        s.cancel_booking(b.id).await.unwrap();
        let free = s.get_free_slots("alice", MONDAY, MONDAY + 24 * H).await.unwrap();
        assert_eq!(free.len(), 2);
    }

    #[tokio::test]
    async fn booking_outside_availability_is_rejected() {
        let s = scheduler("outside.wal", SchedulerConfig::default());
        s.set_availability("alice", vec![rule(1, "09:00", "10:00", 30)])
            .await
            .unwrap();

        // Unaligned start.
        let err = s
            .create_booking("alice", booking(MONDAY + 9 * H + 10 * M, MONDAY + 9 * H + 40 * M))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::SlotNotAvailable);

        // Right start, wrong length.
        let err = s
            .create_booking("alice", booking(MONDAY + 9 * H, MONDAY + 10 * H))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::SlotNotAvailable);

        // Tuesday has no rule.
        let tuesday = MONDAY + DAY_MS;
        let err = s
            .create_booking("alice", booking(tuesday + 9 * H, tuesday + 9 * H + 30 * M))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::SlotNotAvailable);

        // Another subject's rules don't apply.
        let err = s
            .create_booking("carol", booking(MONDAY + 9 * H, MONDAY + 9 * H + 30 * M))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::SlotNotAvailable);
    }

    #[tokio::test]
    async fn inverted_booking_range_is_bad_range() {
        let s = scheduler("inverted.wal", SchedulerConfig::default());
        let err = s
            .create_booking("alice", booking(MONDAY + 10 * H, MONDAY + 9 * H))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::BadRange);
        let err = s.get_free_slots("alice", MONDAY, MONDAY).await.unwrap_err();
        assert_eq!(err, EngineError::BadRange);
    }

    #[tokio::test]
    async fn concurrent_identical_bookings_confirm_once() {
        let s = Arc::new(scheduler("concurrent.wal", SchedulerConfig::default()));
        s.set_availability("alice", vec![rule(1, "09:00", "10:00", 30)])
            .await
            .unwrap();

        let n = 16;
        let mut handles = Vec::new();
        for i in 0..n {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                let mut req = booking(MONDAY + 9 * H, MONDAY + 9 * H + 30 * M);
                req.contact = format!("guest{i}@example.com");
                s.create_booking("alice", req).await
            }));
        }

        let mut confirmed = 0;
        let mut taken = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => confirmed += 1,
                Err(EngineError::SlotTaken) => taken += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(confirmed, 1);
        assert_eq!(taken, n - 1);

        let all = s.list_bookings("alice", None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn double_cancel() {
        let s = scheduler("double_cancel.wal", SchedulerConfig::default());
        s.set_availability("alice", vec![rule(1, "09:00", "10:00", 30)])
            .await
            .unwrap();
        let b = s
            .create_booking("alice", booking(MONDAY + 9 * H, MONDAY + 9 * H + 30 * M))
            .await
            .unwrap();

        let cancelled = s.cancel_booking(b.id).await.unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(
            s.cancel_booking(b.id).await.unwrap_err(),
            EngineError::AlreadyCancelled(b.id)
        );

        let unknown = Ulid::new();
        assert_eq!(
            s.cancel_booking(unknown).await.unwrap_err(),
            EngineError::NotFound(unknown)
        );
    }

    #[tokio::test]
    async fn cancelled_start_can_be_rebooked() {
        let s = scheduler("rebook.wal", SchedulerConfig::default());
        s.set_availability("alice", vec![rule(1, "09:00", "10:00", 30)])
            .await
            .unwrap();
        let slot = (MONDAY + 9 * H, MONDAY + 9 * H + 30 * M);
        let first = s.create_booking("alice", booking(slot.0, slot.1)).await.unwrap();
        s.cancel_booking(first.id).await.unwrap();
        let second = s.create_booking("alice", booking(slot.0, slot.1)).await.unwrap();
        assert_ne!(first.id, second.id);

        let all = s.list_bookings("alice", None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|b| b.is_confirmed()).count(), 1);
    }

    #[tokio::test]
    async fn overlapping_rules_collide_on_start() {
        let s = scheduler("overlap.wal", SchedulerConfig::default());
        s.set_availability(
            "alice",
            vec![rule(1, "09:00", "10:00", 30), rule(1, "09:00", "10:00", 60)],
        )
        .await
        .unwrap();

        let free = s.get_free_slots("alice", MONDAY, MONDAY + DAY_MS).await.unwrap();
        assert_eq!(free.len(), 3);

        // The hour-long slot shares its start with the first half-hour slot.
        s.create_booking("alice", booking(MONDAY + 9 * H, MONDAY + 10 * H))
            .await
            .unwrap();
        let err = s
            .create_booking("alice", booking(MONDAY + 9 * H, MONDAY + 9 * H + 30 * M))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::SlotTaken);

        let free = s.get_free_slots("alice", MONDAY, MONDAY + DAY_MS).await.unwrap();
        assert_eq!(free, vec![Slot::new(MONDAY + 9 * H + 30 * M, MONDAY + 10 * H)]);
    }

    #[tokio::test]
    async fn bookings_just_outside_range_still_subtract() {
        let s = scheduler("pad.wal", SchedulerConfig::default());
        s.set_availability("alice", vec![rule(1, "09:00", "10:00", 60)])
            .await
            .unwrap();
        s.create_booking("alice", booking(MONDAY + 9 * H, MONDAY + 10 * H))
            .await
            .unwrap();

        // Query starts mid-slot: the candidate overlaps the range but its
        // booking starts before `from`.
        let free = s
            .get_free_slots("alice", MONDAY + 9 * H + 15 * M, MONDAY + 11 * H)
            .await
            .unwrap();
        assert!(free.is_empty());
    }

    #[tokio::test]
    async fn negative_pad_never_hides_bookings_at_the_edge() {
        let config = SchedulerConfig {
            booking_pad_ms: -H,
            ..SchedulerConfig::default()
        };
        let s = scheduler("negative_pad.wal", config);
        s.set_availability("alice", vec![rule(1, "09:00", "10:00", 30)])
            .await
            .unwrap();
        s.create_booking("alice", booking(MONDAY + 9 * H, MONDAY + 9 * H + 30 * M))
            .await
            .unwrap();

        let free = s
            .get_free_slots("alice", MONDAY + 9 * H, MONDAY + 10 * H)
            .await
            .unwrap();
        assert_eq!(free, vec![Slot::new(MONDAY + 9 * H + 30 * M, MONDAY + 10 * H)]);
    }

    #[tokio::test]
    async fn unique_rule_per_day_when_configured() {
        let strict = SchedulerConfig {
            unique_rule_per_day: true,
            ..SchedulerConfig::default()
        };
        let s = scheduler("unique_day.wal", strict);
        s.set_availability("alice", vec![rule(1, "09:00", "10:00", 30)])
            .await
            .unwrap();
        let err = s
            .set_availability("alice", vec![rule(1, "14:00", "15:00", 30)])
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::AlreadyExists(1));
        assert_eq!(s.list_availability("alice").await.unwrap().len(), 1);

        // Moving another rule onto the taken day is rejected too.
        let tue = s
            .set_availability("alice", vec![rule(2, "09:00", "10:00", 30)])
            .await
            .unwrap();
        let patch = RulePatch {
            day_of_week: Some(1),
            ..Default::default()
        };
        assert_eq!(
            s.update_availability("alice", tue[0].id, patch).await.unwrap_err(),
            EngineError::AlreadyExists(1)
        );
        let days: Vec<u8> = s
            .list_availability("alice")
            .await
            .unwrap()
            .iter()
            .map(|r| r.day_of_week)
            .collect();
        assert_eq!(days, vec![1, 2]);

        let permissive = scheduler("permissive_day.wal", SchedulerConfig::default());
        permissive
            .set_availability(
                "alice",
                vec![rule(1, "09:00", "10:00", 30), rule(1, "14:00", "15:00", 30)],
            )
            .await
            .unwrap();
        assert_eq!(permissive.list_availability("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_rule_in_batch_stores_nothing() {
        let s = scheduler("invalid_batch.wal", SchedulerConfig::default());
        let err = s
            .set_availability(
                "alice",
                vec![rule(1, "09:00", "10:00", 30), rule(2, "10:00", "09:00", 30)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRule(_)));
        assert!(s.list_availability("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_availability_changes_future_slots() {
        let s = scheduler("update_rule.wal", SchedulerConfig::default());
        let rules = s
            .set_availability("alice", vec![rule(1, "09:00", "10:00", 30)])
            .await
            .unwrap();
        let id = rules[0].id;

        let patch = RulePatch {
            available: Some(false),
            ..Default::default()
        };
        let updated = s.update_availability("alice", id, patch).await.unwrap();
        assert!(!updated.available);
        assert!(s.get_free_slots("alice", MONDAY, MONDAY + DAY_MS).await.unwrap().is_empty());
        assert_eq!(
            s.create_booking("alice", booking(MONDAY + 9 * H, MONDAY + 9 * H + 30 * M))
                .await
                .unwrap_err(),
            EngineError::SlotNotAvailable
        );

        // Patch that would invert the window is rejected against the stored rule.
        let patch = RulePatch {
            end_time: "08:00".parse().ok(),
            ..Default::default()
        };
        assert!(matches!(
            s.update_availability("alice", id, patch).await,
            Err(EngineError::InvalidRule(_))
        ));

        // Another subject cannot see the rule.
        let patch = RulePatch {
            available: Some(true),
            ..Default::default()
        };
        assert_eq!(
            s.update_availability("bob", id, patch).await.unwrap_err(),
            EngineError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn list_bookings_by_range() {
        let s = scheduler("list_range.wal", SchedulerConfig::default());
        s.set_availability("alice", vec![rule(1, "09:00", "12:00", 60)])
            .await
            .unwrap();
        for h in [9, 10, 11] {
            s.create_booking("alice", booking(MONDAY + h * H, MONDAY + (h + 1) * H))
                .await
                .unwrap();
        }

        let in_range = s
            .list_bookings("alice", Some(RangeQuery::new(MONDAY + 10 * H, MONDAY + 11 * H)))
            .await
            .unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].start_at, MONDAY + 10 * H);

        let err = s
            .list_bookings("alice", Some(RangeQuery::new(MONDAY + H, MONDAY)))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::BadRange);
    }

    #[tokio::test]
    async fn oversized_query_window_is_refused() {
        let s = scheduler("window.wal", SchedulerConfig::default());
        let err = s
            .get_free_slots("alice", MONDAY, MONDAY + MAX_QUERY_WINDOW_MS + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }
}
