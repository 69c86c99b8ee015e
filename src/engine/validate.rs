use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::{EngineError, Rejection};

/// Calendar date used for defaulted booking starts and closures.
pub fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// Reduce a multi-night price to its one-night equivalent. No-op for `nights <= 1`.
pub fn normalize(rate: &mut NewRate) {
    if rate.nights > 1 {
        rate.value /= f64::from(rate.nights);
        rate.nights = 1;
    }
}

/// Admission checks for a candidate rate against the unit's current rates.
/// Checks run in a fixed order and the first failure wins.
pub fn validate_new_rate(
    candidate: &NewRate,
    existing: &[Rate],
    today: NaiveDate,
) -> Result<(), EngineError> {
    if candidate.stay_from > candidate.stay_to {
        return Err(Rejection::StayRangeInverted.into());
    }
    // NaN fails this too.
    if !(candidate.value > 0.0) {
        return Err(Rejection::NonPositiveValue.into());
    }
    if candidate.nights == 0 {
        return Err(Rejection::NonPositiveNights.into());
    }
    if candidate.unit_id.is_nil() {
        return Err(Rejection::MissingUnit.into());
    }
    if let (Some(from), Some(to)) = (candidate.book_from, candidate.book_to)
        && from > to
    {
        return Err(Rejection::BookingWindowInverted.into());
    }

    let stay = StayRange::new(candidate.stay_from, candidate.stay_to);
    let covering = existing.iter().find(|e| {
        e.stay.contains_range(&stay)
            && e.value == candidate.value
            && e.booking.closes().is_none_or(|closes| closes > today)
    });
    if let Some(e) = covering {
        return Err(EngineError::DuplicateRate(e.id));
    }
    Ok(())
}

/// Reject values and dates outside what the engine is willing to store.
pub(crate) fn check_bounds(candidate: &NewRate) -> Result<(), EngineError> {
    let dates = [
        Some(candidate.stay_from),
        Some(candidate.stay_to),
        candidate.book_from,
        candidate.book_to,
    ];
    for date in dates.into_iter().flatten() {
        check_date(date)?;
    }
    if candidate.value > MAX_RATE_VALUE {
        return Err(EngineError::LimitExceeded("rate value too large"));
    }
    Ok(())
}

pub(crate) fn check_date(date: NaiveDate) -> Result<(), EngineError> {
    if date.year() < MIN_YEAR || date.year() > MAX_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn candidate(from: NaiveDate, to: NaiveDate, value: f64) -> NewRate {
        NewRate {
            unit_id: Ulid::new(),
            stay_from: from,
            stay_to: to,
            nights: 1,
            value,
            book_from: Some(day(2025, 1, 1)),
            book_to: None,
        }
    }

    fn existing(unit_id: Ulid, from: NaiveDate, to: NaiveDate, value: f64, booking: BookingWindow) -> Rate {
        Rate {
            id: Ulid::new(),
            unit_id,
            stay: StayRange::new(from, to),
            nights: 1,
            value,
            booking,
        }
    }

    fn rejection(result: Result<(), EngineError>) -> Rejection {
        match result {
            Err(EngineError::InvalidInput(r)) => r,
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn normalize_single_night_is_noop() {
        let mut r = candidate(day(2025, 3, 1), day(2025, 3, 10), 3000.0);
        let before = r.clone();
        normalize(&mut r);
        assert_eq!(r, before);
    }

    #[test]
    fn normalize_divides_multi_night_value() {
        let mut r = candidate(day(2025, 3, 1), day(2025, 3, 10), 9000.0);
        r.nights = 3;
        normalize(&mut r);
        assert_eq!(r.nights, 1);
        assert_eq!(r.value, 3000.0);

        // second pass changes nothing
        normalize(&mut r);
        assert_eq!(r.nights, 1);
        assert_eq!(r.value, 3000.0);
    }

    #[test]
    fn accepts_well_formed_rate() {
        let r = candidate(day(2025, 3, 1), day(2025, 3, 10), 3000.0);
        assert!(validate_new_rate(&r, &[], day(2025, 1, 1)).is_ok());
    }

    #[test]
    fn single_night_stay_is_valid() {
        let r = candidate(day(2025, 3, 1), day(2025, 3, 1), 3000.0);
        assert!(validate_new_rate(&r, &[], day(2025, 1, 1)).is_ok());
    }

    #[test]
    fn rejects_inverted_stay() {
        let r = candidate(day(2025, 3, 10), day(2025, 3, 1), 3000.0);
        assert_eq!(
            rejection(validate_new_rate(&r, &[], day(2025, 1, 1))),
            Rejection::StayRangeInverted
        );
    }

    #[test]
    fn rejects_non_positive_value() {
        for value in [0.0, -5.0, f64::NAN] {
            let r = candidate(day(2025, 3, 1), day(2025, 3, 10), value);
            assert_eq!(
                rejection(validate_new_rate(&r, &[], day(2025, 1, 1))),
                Rejection::NonPositiveValue
            );
        }
    }

    #[test]
    fn rejects_zero_nights() {
        let mut r = candidate(day(2025, 3, 1), day(2025, 3, 10), 3000.0);
        r.nights = 0;
        assert_eq!(
            rejection(validate_new_rate(&r, &[], day(2025, 1, 1))),
            Rejection::NonPositiveNights
        );
    }

    #[test]
    fn rejects_nil_unit() {
        let mut r = candidate(day(2025, 3, 1), day(2025, 3, 10), 3000.0);
        r.unit_id = Ulid::nil();
        assert_eq!(
            rejection(validate_new_rate(&r, &[], day(2025, 1, 1))),
            Rejection::MissingUnit
        );
    }

    #[test]
    fn rejects_inverted_booking_window() {
        let mut r = candidate(day(2025, 3, 1), day(2025, 3, 10), 3000.0);
        r.book_from = Some(day(2025, 2, 1));
        r.book_to = Some(day(2025, 1, 1));
        assert_eq!(
            rejection(validate_new_rate(&r, &[], day(2025, 1, 1))),
            Rejection::BookingWindowInverted
        );
    }

    #[test]
    fn checks_run_in_order() {
        // inverted stay and bad value: the stay check reports first
        let mut r = candidate(day(2025, 3, 10), day(2025, 3, 1), -1.0);
        r.nights = 0;
        assert_eq!(
            rejection(validate_new_rate(&r, &[], day(2025, 1, 1))),
            Rejection::StayRangeInverted
        );
    }

    #[test]
    fn rejects_contained_duplicate_of_active_rate() {
        let r = candidate(day(2025, 3, 5), day(2025, 3, 10), 3000.0);
        let e = existing(
            r.unit_id,
            day(2025, 3, 1),
            day(2025, 3, 31),
            3000.0,
            BookingWindow::Active { opens: day(2025, 1, 1) },
        );
        match validate_new_rate(&r, std::slice::from_ref(&e), day(2025, 1, 1)) {
            Err(EngineError::DuplicateRate(id)) => assert_eq!(id, e.id),
            other => panic!("expected DuplicateRate, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_check_considers_future_closing_rates() {
        let today = day(2025, 1, 10);
        let r = candidate(day(2025, 3, 5), day(2025, 3, 10), 3000.0);
        let closing_later = existing(
            r.unit_id,
            day(2025, 3, 1),
            day(2025, 3, 31),
            3000.0,
            BookingWindow::Closed { opens: day(2025, 1, 1), closes: day(2025, 1, 11) },
        );
        assert!(matches!(
            validate_new_rate(&r, &[closing_later], today),
            Err(EngineError::DuplicateRate(_))
        ));

        // closing today is no longer "in the future"
        let closing_today = existing(
            r.unit_id,
            day(2025, 3, 1),
            day(2025, 3, 31),
            3000.0,
            BookingWindow::Closed { opens: day(2025, 1, 1), closes: today },
        );
        assert!(validate_new_rate(&r, &[closing_today], today).is_ok());
    }

    #[test]
    fn different_value_or_partial_cover_is_not_duplicate() {
        let r = candidate(day(2025, 3, 5), day(2025, 4, 10), 3000.0);
        let opens = BookingWindow::Active { opens: day(2025, 1, 1) };
        let partial = existing(r.unit_id, day(2025, 3, 1), day(2025, 3, 31), 3000.0, opens);
        let other_value = existing(r.unit_id, day(2025, 1, 1), day(2025, 12, 31), 3000.5, opens);
        assert!(validate_new_rate(&r, &[partial, other_value], day(2025, 1, 1)).is_ok());
    }

    #[test]
    fn bounds_reject_far_dates_and_huge_values() {
        let mut r = candidate(day(2025, 3, 1), day(2025, 3, 10), 3000.0);
        r.book_to = Some(day(1800, 1, 1));
        assert!(matches!(check_bounds(&r), Err(EngineError::LimitExceeded(_))));

        let mut r = candidate(day(2025, 3, 1), day(2025, 3, 10), MAX_RATE_VALUE * 2.0);
        r.book_from = None;
        assert!(matches!(check_bounds(&r), Err(EngineError::LimitExceeded(_))));

        let r = candidate(day(2025, 3, 1), day(2025, 3, 10), 3000.0);
        assert!(check_bounds(&r).is_ok());
    }
}
