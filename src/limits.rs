//! Hard ceilings enforced by the engine and the SQL front end.

/// Distinct units tracked by one engine.
pub const MAX_UNITS: usize = 100_000;

/// Records (active + closed) kept on a single unit's timeline.
pub const MAX_RATES_PER_UNIT: usize = 50_000;

/// Nights in a single quoted stay.
pub const MAX_QUOTE_NIGHTS: i64 = 3_660;

/// Data rows accepted by one spreadsheet import.
pub const MAX_IMPORT_ROWS: usize = 100_000;

/// Upper bound on a rate's `value`.
pub const MAX_RATE_VALUE: f64 = 1e12;

/// Supported calendar years for stay and booking dates.
pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 9999;
