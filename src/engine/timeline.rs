use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;

// ── Staged edits ─────────────────────────────────────────────────

/// A unit timeline being edited. Every change is applied to `state` and
/// recorded in `events`, so the whole edit can be committed to the WAL as
/// one record or dropped without a trace.
#[derive(Debug, Clone)]
pub struct Draft {
    pub state: UnitState,
    pub events: Vec<Event>,
}

impl Draft {
    pub fn new(base: &UnitState) -> Self {
        Self {
            state: base.clone(),
            events: Vec::new(),
        }
    }

    pub fn unit_id(&self) -> Ulid {
        self.state.id
    }

    pub fn apply(&mut self, event: Event) {
        self.state.apply(&event);
        self.events.push(event);
    }

    /// Close `rate` at `closes`, or delete it when that would close it before
    /// it ever opened.
    pub fn retire(&mut self, rate: &Rate, closes: NaiveDate) {
        let unit_id = self.unit_id();
        match rate.booking.close(closes) {
            Some(_) => self.apply(Event::RateClosed {
                id: rate.id,
                unit_id,
                book_to: closes,
            }),
            None => {
                debug!(rate = %rate.id, "dropping rate closed before it opened");
                self.apply(Event::RateDeleted { id: rate.id, unit_id });
            }
        }
    }
}

// ── Split phase ──────────────────────────────────────────────────

/// Make room on the active timeline for a rate over `stay` that becomes
/// bookable on `opens`.
///
/// Every active rate sharing a night with `stay` is retired at `opens`. The
/// parts of it outside `stay` come back as new active fragments opening at
/// `opens`, so the active set stays non-overlapping once the new rate is
/// inserted. Returns the number of rates retired.
pub fn split_overlapping(draft: &mut Draft, stay: &StayRange, opens: NaiveDate) -> usize {
    let overlapping: Vec<Rate> = draft.state.active_overlapping(stay).cloned().collect();

    for old in &overlapping {
        draft.retire(old, opens);

        if old.stay.from < stay.from
            && let Some(end) = stay.from.pred_opt()
        {
            let before = old.fragment(StayRange::new(old.stay.from, end), opens);
            debug!(old = %old.id, fragment = %before.id, "before-fragment {}..={}", before.stay.from, before.stay.to);
            draft.apply(Event::RateAdded { rate: before });
        }

        if old.stay.to > stay.to
            && let Some(start) = stay.to.succ_opt()
        {
            let after = old.fragment(StayRange::new(start, old.stay.to), opens);
            debug!(old = %old.id, fragment = %after.id, "after-fragment {}..={}", after.stay.from, after.stay.to);
            draft.apply(Event::RateAdded { rate: after });
        }
    }

    overlapping.len()
}

// ── Merge phase ──────────────────────────────────────────────────

/// One left-to-right sweep over the active rates, collapsing each
/// date-adjacent pair with exactly equal values into a single rate.
///
/// The left rate of a pair is retired at the right rate's booking start and
/// the right rate is deleted outright; the merged rate opens when the right
/// one did. A merged rate is not reconsidered in the same sweep, so a chain
/// of three or more mergeable rates needs another call to collapse fully.
/// Returns the number of merges.
pub fn merge_adjacent(draft: &mut Draft) -> usize {
    let active: Vec<Rate> = draft.state.active().cloned().collect();
    let unit_id = draft.unit_id();
    let mut merges = 0;
    let mut i = 0;

    while i + 1 < active.len() {
        let (current, next) = (&active[i], &active[i + 1]);
        // exact equality, no tolerance
        if current.value == next.value && current.stay.precedes(&next.stay) {
            let opens = next.booking.opens();
            let merged = Rate {
                id: Ulid::new(),
                unit_id,
                stay: StayRange::new(current.stay.from, next.stay.to),
                nights: 1,
                value: current.value,
                booking: BookingWindow::Active { opens },
            };
            debug!(left = %current.id, right = %next.id, merged = %merged.id, "merging adjacent rates");

            draft.retire(current, opens);
            draft.apply(Event::RateAdded { rate: merged });
            draft.apply(Event::RateDeleted { id: next.id, unit_id });
            merges += 1;
            i += 2;
        } else {
            i += 1;
        }
    }

    merges
}

/// True when no two active rates share a night.
pub fn active_disjoint(unit: &UnitState) -> bool {
    let active: Vec<&Rate> = unit.active().collect();
    active.windows(2).all(|w| w[0].stay.to < w[1].stay.from)
}
