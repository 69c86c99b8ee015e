use chrono::NaiveDate;
use ulid::Ulid;

/// Why a rate or a request was refused before touching any timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    StayRangeInverted,
    NonPositiveValue,
    NonPositiveNights,
    MissingUnit,
    BookingWindowInverted,
    /// A quote whose arrival is not strictly before its departure.
    EmptyStay,
    /// A soft-close dated before the rate became bookable.
    CloseBeforeOpen,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Rejection::StayRangeInverted => "stay start date cannot be after end date",
            Rejection::NonPositiveValue => "rate value must be positive",
            Rejection::NonPositiveNights => "number of nights must be positive",
            Rejection::MissingUnit => "unit id is required",
            Rejection::BookingWindowInverted => "booking start date cannot be after booking end date",
            Rejection::EmptyStay => "arrival date must be before departure date",
            Rejection::CloseBeforeOpen => "close date cannot precede the booking start date",
        };
        f.write_str(msg)
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    InvalidInput(Rejection),
    /// An existing, still-valid rate already covers the stay at the same value.
    DuplicateRate(Ulid),
    /// No rate prices this night for the requested booking date.
    Unresolvable(NaiveDate),
    AlreadyClosed(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "rate not found: {id}"),
            EngineError::InvalidInput(reason) => write!(f, "invalid input: {reason}"),
            EngineError::DuplicateRate(id) => {
                write!(f, "identical rate already exists within this period: {id}")
            }
            EngineError::Unresolvable(date) => write!(f, "no rate found for date: {date}"),
            EngineError::AlreadyClosed(id) => write!(f, "rate already closed: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Rejection> for EngineError {
    fn from(reason: Rejection) -> Self {
        EngineError::InvalidInput(reason)
    }
}
