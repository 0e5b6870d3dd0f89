use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

/// Opaque identifier of the person whose availability is scheduled.
pub type SubjectId = String;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Start of the calendar day containing `t`.
pub fn floor_day(t: Ms) -> Ms {
    t.div_euclid(DAY_MS) * DAY_MS
}

/// Day of week of the calendar day containing `t`, Sunday = 0.
/// Day 0 of the timeline (1970-01-01) was a Thursday.
pub fn weekday(t: Ms) -> u8 {
    (t.div_euclid(DAY_MS) + 4).rem_euclid(7) as u8
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Time of day ──────────────────────────────────────────────────

/// Minute-resolution time of day, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeError(String);

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day: {:?} (expected HH:MM)", self.0)
    }
}

impl std::error::Error for ParseTimeError {}

impl TimeOfDay {
    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self(hour * 60 + minute))
    }

    /// Offset from the start of the day.
    pub fn offset_ms(self) -> Ms {
        self.0 as Ms * MINUTE_MS
    }
}

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    /// Accepts `HH:MM`; anything after the first five characters
    /// (seconds, fractions) is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(s.to_string());
        let hm = s.get(..5).ok_or_else(err)?;
        let (h, m) = hm.split_once(':').ok_or_else(err)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(err());
        }
        let hour: u16 = h.parse().map_err(|_| err())?;
        let minute: u16 = m.parse().map_err(|_| err())?;
        Self::from_hm(hour, minute).ok_or_else(err)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ParseTimeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> String {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

// ── Rules ────────────────────────────────────────────────────────

/// A recurring weekly availability statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub subject_id: SubjectId,
    /// 0–6, Sunday = 0.
    pub day_of_week: u8,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub slot_length_minutes: u32,
    /// `false` marks the window as explicitly unavailable.
    pub available: bool,
    pub title: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl AvailabilityRule {
    pub fn slot_length_ms(&self) -> Ms {
        self.slot_length_minutes as Ms * MINUTE_MS
    }

    /// The rule's window on the day starting at `day_start`.
    pub fn window_on(&self, day_start: Ms) -> (Ms, Ms) {
        (
            day_start + self.start_time.offset_ms(),
            day_start + self.end_time.offset_ms(),
        )
    }
}

/// Partial update of a rule. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulePatch {
    #[serde(default)]
    pub day_of_week: Option<u8>,
    #[serde(default)]
    pub start_time: Option<TimeOfDay>,
    #[serde(default)]
    pub end_time: Option<TimeOfDay>,
    #[serde(default)]
    pub slot_length_minutes: Option<u32>,
    #[serde(default)]
    pub available: Option<bool>,
    #[serde(default)]
    pub title: Option<String>,
}

impl RulePatch {
    pub fn apply(&self, rule: &mut AvailabilityRule, now: Ms) {
        if let Some(d) = self.day_of_week {
            rule.day_of_week = d;
        }
        if let Some(t) = self.start_time {
            rule.start_time = t;
        }
        if let Some(t) = self.end_time {
            rule.end_time = t;
        }
        if let Some(len) = self.slot_length_minutes {
            rule.slot_length_minutes = len;
        }
        if let Some(a) = self.available {
            rule.available = a;
        }
        if let Some(ref t) = self.title {
            rule.title = Some(t.clone());
        }
        rule.updated_at = now;
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

/// Descriptive fields carried through a booking. Only their length is checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingMeta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl BookingMeta {
    pub fn fields(&self) -> [Option<&str>; 4] {
        [
            self.title.as_deref(),
            self.description.as_deref(),
            self.source.as_deref(),
            self.kind.as_deref(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub subject_id: SubjectId,
    pub contact: String,
    pub start_at: Ms,
    pub end_at: Ms,
    pub status: BookingStatus,
    pub meta: BookingMeta,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// A derived bookable window. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start_at: Ms,
    pub end_at: Ms,
}

impl Slot {
    pub fn new(start_at: Ms, end_at: Ms) -> Self {
        debug_assert!(start_at < end_at, "Slot start must be before end");
        Self { start_at, end_at }
    }

    pub fn span(&self) -> Span {
        Span::new(self.start_at, self.end_at)
    }
}

// ── Per-subject state ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SubjectState {
    pub id: SubjectId,
    /// Rules in insertion order.
    pub rules: Vec<AvailabilityRule>,
    /// All bookings (any status), sorted by `start_at`.
    pub bookings: Vec<Booking>,
}

impl SubjectState {
    pub fn new(id: SubjectId) -> Self {
        Self {
            id,
            rules: Vec::new(),
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by start; equal starts keep arrival order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.start_at <= booking.start_at);
        self.bookings.insert(pos, booking);
    }

    pub fn rule_mut(&mut self, id: Ulid) -> Option<&mut AvailabilityRule> {
        self.rules.iter_mut().find(|r| r.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// The confirmed booking starting exactly at `start`, if any.
    pub fn confirmed_at(&self, start: Ms) -> Option<&Booking> {
        self.starting_in(start, start + 1).find(|b| b.is_confirmed())
    }

    /// Bookings whose start lies in `[from, to)`.
    pub fn starting_in(&self, from: Ms, to: Ms) -> impl Iterator<Item = &Booking> {
        let lo = self.bookings.partition_point(|b| b.start_at < from);
        let hi = self.bookings.partition_point(|b| b.start_at < to).max(lo);
        self.bookings[lo..hi].iter()
    }
}

/// WAL record. One event per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// One set-availability call; applied as a unit.
    RulesAdded {
        subject_id: SubjectId,
        rules: Vec<AvailabilityRule>,
    },
    RuleUpdated { rule: AvailabilityRule },
    BookingConfirmed { booking: Booking },
    BookingCancelled { id: Ulid, subject_id: SubjectId },
}

impl Event {
    pub fn subject_id(&self) -> &str {
        match self {
            Event::RulesAdded { subject_id, .. } => subject_id,
            Event::RuleUpdated { rule } => &rule.subject_id,
            Event::BookingConfirmed { booking } => &booking.subject_id,
            Event::BookingCancelled { subject_id, .. } => subject_id,
        }
    }
}
