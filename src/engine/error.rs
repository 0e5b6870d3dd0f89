use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Caller-supplied interval is malformed (`start >= end`).
    BadRange,
    InvalidRule(String),
    /// Requested window is not one of the derived candidate slots.
    SlotNotAvailable,
    /// A confirmed booking already starts at the requested instant.
    SlotTaken,
    NotFound(Ulid),
    AlreadyCancelled(Ulid),
    /// A rule for this day already exists (only with `unique_rule_per_day`).
    AlreadyExists(u8),
    InvalidRequest(String),
    LimitExceeded(&'static str),
    WalError(String),
}

/// Coarse grouping used by adapters to pick a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    Conflict,
    NotFound,
    Internal,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::BadRequest => "bad_request",
            ErrorClass::Conflict => "conflict",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Internal => "internal",
        }
    }
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BadRange => "bad_range",
            EngineError::InvalidRule(_) => "invalid_rule",
            EngineError::SlotNotAvailable => "slot_not_available",
            EngineError::SlotTaken => "slot_taken",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::BadRange
            | EngineError::InvalidRule(_)
            | EngineError::SlotNotAvailable
            | EngineError::InvalidRequest(_)
            | EngineError::LimitExceeded(_) => ErrorClass::BadRequest,
            EngineError::SlotTaken
            | EngineError::AlreadyCancelled(_)
            | EngineError::AlreadyExists(_) => ErrorClass::Conflict,
            EngineError::NotFound(_) => ErrorClass::NotFound,
            EngineError::WalError(_) => ErrorClass::Internal,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::BadRange => write!(f, "start must be before end"),
            EngineError::InvalidRule(reason) => write!(f, "invalid rule: {reason}"),
            EngineError::SlotNotAvailable => write!(f, "slot not available"),
            EngineError::SlotTaken => write!(f, "slot already booked"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyCancelled(id) => write!(f, "booking already cancelled: {id}"),
            EngineError::AlreadyExists(day) => {
                write!(f, "availability already exists for day {day}")
            }
            EngineError::InvalidRequest(reason) => write!(f, "invalid request: {reason}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
