use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Inclusive calendar range `[from, to]` of nights a rate may price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl StayRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        debug_assert!(from <= to, "StayRange from must not be after to");
        Self { from, to }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.from <= day && day <= self.to
    }

    /// Inclusive overlap: sharing a single night counts.
    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.from <= other.to && other.from <= self.to
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &StayRange) -> bool {
        self.from <= other.from && other.to <= self.to
    }

    /// True when `other` starts the night after `self` ends.
    pub fn precedes(&self, other: &StayRange) -> bool {
        self.to.succ_opt() == Some(other.from)
    }
}

/// When a reservation may select a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingWindow {
    /// Selectable from `opens` on, no retirement date set.
    Active { opens: NaiveDate },
    /// Retired: only bookings made within `[opens, closes]` still see it.
    Closed { opens: NaiveDate, closes: NaiveDate },
}

impl BookingWindow {
    pub fn opens(&self) -> NaiveDate {
        match *self {
            BookingWindow::Active { opens } | BookingWindow::Closed { opens, .. } => opens,
        }
    }

    pub fn closes(&self) -> Option<NaiveDate> {
        match *self {
            BookingWindow::Active { .. } => None,
            BookingWindow::Closed { closes, .. } => Some(closes),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, BookingWindow::Active { .. })
    }

    /// Retire the window at `closes`. Returns `None` when that would close it
    /// before it ever opened.
    pub fn close(self, closes: NaiveDate) -> Option<BookingWindow> {
        let opens = self.opens();
        (opens <= closes).then_some(BookingWindow::Closed { opens, closes })
    }

    /// Whether a booking made on `date` may select the rate.
    pub fn admits(&self, date: NaiveDate) -> bool {
        match *self {
            BookingWindow::Active { opens } => opens <= date,
            BookingWindow::Closed { opens, closes } => opens <= date && date <= closes,
        }
    }
}

/// A persisted pricing rule. Never edited in place: closing swaps its
/// booking window, everything else is fixed for the record's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub id: Ulid,
    pub unit_id: Ulid,
    pub stay: StayRange,
    pub nights: u32,
    pub value: f64,
    pub booking: BookingWindow,
}

impl Rate {
    pub fn nightly(&self) -> f64 {
        self.value / f64::from(self.nights)
    }

    pub fn is_active(&self) -> bool {
        self.booking.is_active()
    }

    /// Fresh active record carrying this rate's price over `stay`.
    pub fn fragment(&self, stay: StayRange, opens: NaiveDate) -> Rate {
        Rate {
            id: Ulid::new(),
            unit_id: self.unit_id,
            stay,
            nights: self.nights,
            value: self.value,
            booking: BookingWindow::Active { opens },
        }
    }
}

/// A rate as submitted for creation. Fields are unchecked until validated.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRate {
    pub unit_id: Ulid,
    pub stay_from: NaiveDate,
    pub stay_to: NaiveDate,
    pub nights: u32,
    pub value: f64,
    /// Defaults to today when absent.
    pub book_from: Option<NaiveDate>,
    /// Only checked for ordering; every new rate enters the timeline active.
    pub book_to: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct UnitState {
    pub id: Ulid,
    /// Active and closed rates, sorted by `stay.from`.
    rates: Vec<Rate>,
}

impl UnitState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            rates: Vec::new(),
        }
    }

    /// All rates ordered by stay start.
    pub fn rates(&self) -> &[Rate] {
        &self.rates
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<&Rate> {
        self.rates.iter().find(|r| r.id == *id)
    }

    /// Active rates ordered by stay start.
    pub fn active(&self) -> impl Iterator<Item = &Rate> {
        self.rates.iter().filter(|r| r.is_active())
    }

    /// Active rates whose stay range shares at least one night with `stay`.
    /// Uses binary search to skip rates starting after `stay.to`.
    pub fn active_overlapping(&self, stay: &StayRange) -> impl Iterator<Item = &Rate> {
        let right_bound = self.rates.partition_point(|r| r.stay.from <= stay.to);
        self.rates[..right_bound]
            .iter()
            .filter(move |r| r.is_active() && r.stay.overlaps(stay))
    }

    /// Insert after any rate with the same stay start, keeping insertion order stable.
    pub fn insert_rate(&mut self, rate: Rate) {
        let pos = self.rates.partition_point(|r| r.stay.from <= rate.stay.from);
        self.rates.insert(pos, rate);
    }

    pub fn remove_rate(&mut self, id: &Ulid) -> Option<Rate> {
        let pos = self.rates.iter().position(|r| r.id == *id)?;
        Some(self.rates.remove(pos))
    }

    /// Apply a WAL event. Events for other units are ignored; a batch is
    /// applied member by member, so one spanning two units updates each.
    pub fn apply(&mut self, event: &Event) {
        if !matches!(event, Event::Batch { .. }) && event.unit_id() != self.id {
            return;
        }
        match event {
            Event::RateAdded { rate } => self.insert_rate(rate.clone()),
            Event::RateClosed { id, book_to, .. } => {
                if let Some(rate) = self.rates.iter_mut().find(|r| r.id == *id)
                    && let Some(closed) = rate.booking.close(*book_to)
                {
                    rate.booking = closed;
                }
            }
            Event::RateDeleted { id, .. } => {
                self.remove_rate(id);
            }
            Event::Batch { events, .. } => {
                for e in events {
                    self.apply(e);
                }
            }
        }
    }
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RateAdded {
        rate: Rate,
    },
    RateClosed {
        id: Ulid,
        unit_id: Ulid,
        book_to: NaiveDate,
    },
    RateDeleted {
        id: Ulid,
        unit_id: Ulid,
    },
    /// Changes to one unit that replay together or not at all.
    Batch {
        unit_id: Ulid,
        events: Vec<Event>,
    },
}

impl Event {
    pub fn unit_id(&self) -> Ulid {
        match self {
            Event::RateAdded { rate } => rate.unit_id,
            Event::RateClosed { unit_id, .. }
            | Event::RateDeleted { unit_id, .. }
            | Event::Batch { unit_id, .. } => *unit_id,
        }
    }

    /// Every unit the event touches, in id order.
    pub fn units(&self) -> Vec<Ulid> {
        match self {
            Event::Batch { events, .. } => {
                let mut ids: Vec<Ulid> = events.iter().flat_map(Event::units).collect();
                ids.sort();
                ids.dedup();
                ids
            }
            other => vec![other.unit_id()],
        }
    }
}

#[cfg(test)]
pub(crate) fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}
