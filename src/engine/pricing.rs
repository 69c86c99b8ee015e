use chrono::NaiveDate;

use crate::limits::MAX_QUOTE_NIGHTS;
use crate::model::Rate;

use super::{EngineError, Rejection};

/// Total price of the nights `[arrival, departure)` for a booking made on
/// `booking_date`.
///
/// Each night is priced independently. Closed rates whose booking window
/// admitted the booking date take precedence over active ones, so a guest
/// keeps the price that was on offer when they booked. `rates` must be
/// sorted by stay start.
pub fn quote_stay(
    rates: &[Rate],
    arrival: NaiveDate,
    departure: NaiveDate,
    booking_date: NaiveDate,
) -> Result<f64, EngineError> {
    if arrival >= departure {
        return Err(Rejection::EmptyStay.into());
    }
    let nights = (departure - arrival).num_days();
    if nights > MAX_QUOTE_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long to quote"));
    }

    let (active, closed): (Vec<&Rate>, Vec<&Rate>) = rates.iter().partition(|r| r.is_active());

    let mut total = 0.0;
    for night in arrival.iter_days().take(nights as usize) {
        let rate = closed_rate_for(&closed, night, booking_date)
            .or_else(|| active_rate_for(&active, night, booking_date))
            .ok_or(EngineError::Unresolvable(night))?;
        total += rate.nightly();
    }
    Ok(total)
}

/// First closed rate in stay order that covers `night` and was bookable on
/// `booking_date`. Closed ranges may overlap, so this scans every candidate
/// starting on or before the night.
fn closed_rate_for<'a>(closed: &[&'a Rate], night: NaiveDate, booking_date: NaiveDate) -> Option<&'a Rate> {
    let end = closed.partition_point(|r| r.stay.from <= night);
    closed[..end]
        .iter()
        .find(|r| r.stay.contains(night) && r.booking.admits(booking_date))
        .copied()
}

/// Active ranges never overlap, so at most one covers `night`.
fn active_rate_for<'a>(active: &[&'a Rate], night: NaiveDate, booking_date: NaiveDate) -> Option<&'a Rate> {
    let idx = active.partition_point(|r| r.stay.to < night);
    active
        .get(idx)
        .filter(|r| r.stay.contains(night) && r.booking.admits(booking_date))
        .copied()
}
