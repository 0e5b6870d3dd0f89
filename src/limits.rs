use crate::model::{Ms, DAY_MS};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Widest range a free-slot query may expand.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_RULES_PER_SUBJECT: usize = 1_000;
pub const MAX_RULES_PER_REQUEST: usize = 100;
pub const MAX_BOOKINGS_PER_SUBJECT: usize = 100_000;

pub const MAX_SUBJECT_ID_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 320;
pub const MAX_META_FIELD_LEN: usize = 4_096;
pub const MAX_TITLE_LEN: usize = 256;

/// One week.
pub const MAX_SLOT_LENGTH_MINUTES: u32 = 7 * 24 * 60;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
