use chrono::NaiveDate;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::timeline::{merge_adjacent, split_overlapping, Draft};
use super::validate::{check_bounds, check_date, normalize, today, validate_new_rate};
use super::{Engine, EngineError, Rejection, WalCommand};

/// Validate `new` against the draft timeline, then split, insert and run one
/// merge sweep. Returns the active rate that ends up pricing the new stay.
fn stage_create(draft: &mut Draft, new: &NewRate, today: NaiveDate) -> Result<Rate, EngineError> {
    validate_new_rate(new, draft.state.rates(), today)?;
    if draft.state.len() >= MAX_RATES_PER_UNIT {
        return Err(EngineError::LimitExceeded("too many rates on unit"));
    }

    let opens = new.book_from.unwrap_or(today);
    let stay = StayRange::new(new.stay_from, new.stay_to);
    let rate = Rate {
        id: Ulid::new(),
        unit_id: new.unit_id,
        stay,
        nights: new.nights,
        value: new.value,
        booking: BookingWindow::Active { opens },
    };

    let splits = split_overlapping(draft, &stay, opens);
    draft.apply(Event::RateAdded { rate: rate.clone() });
    let merges = merge_adjacent(draft);

    metrics::counter!(crate::observability::RATES_CREATED_TOTAL).increment(1);
    metrics::counter!(crate::observability::SPLITS_TOTAL).increment(splits as u64);
    metrics::counter!(crate::observability::MERGES_TOTAL).increment(merges as u64);
    debug!(
        unit = %new.unit_id,
        rate = %rate.id,
        splits,
        merges,
        "staged rate {}..={} at {}",
        stay.from,
        stay.to,
        new.value
    );

    // A merge may have folded the new record into a wider one.
    let stored = draft
        .state
        .active_overlapping(&stay)
        .find(|r| r.stay.contains_range(&stay))
        .cloned()
        .unwrap_or(rate);
    Ok(stored)
}

/// Retire the rate being replaced. Already-closed rates are left as they are.
fn stage_replace(draft: &mut Draft, id: Ulid, today: NaiveDate) -> Result<(), EngineError> {
    let current = draft.state.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
    if current.is_active() {
        draft.retire(&current, today);
    }
    Ok(())
}

impl Engine {
    pub async fn create_rate(&self, mut new: NewRate) -> Result<Rate, EngineError> {
        let today = today();
        normalize(&mut new);
        new.book_from.get_or_insert(today);
        // Field checks run before a unit is registered for the id, and ahead
        // of the storage limits.
        validate_new_rate(&new, &[], today)?;
        check_bounds(&new)?;

        let _gate = self.write_gate.read().await;
        let unit = self.unit_or_create(new.unit_id)?;
        let mut guard = unit.write().await;
        let mut draft = Draft::new(&guard);
        let rate = stage_create(&mut draft, &new, today)?;
        self.commit(&mut guard, draft).await?;
        Ok(rate)
    }

    /// Replace a rate: the old one stops being bookable today and the
    /// replacement becomes bookable today.
    pub async fn update_rate(&self, id: Ulid, mut replacement: NewRate) -> Result<Rate, EngineError> {
        let today = today();
        normalize(&mut replacement);
        replacement.book_from = Some(today);
        validate_new_rate(&replacement, &[], today)?;
        check_bounds(&replacement)?;

        let _gate = self.write_gate.read().await;
        let old_unit_id = self.unit_for_rate(&id).ok_or(EngineError::NotFound(id))?;

        if old_unit_id == replacement.unit_id {
            let (_, mut guard) = self.resolve_rate_write(&id).await?;
            let mut draft = Draft::new(&guard);
            stage_replace(&mut draft, id, today)?;
            let rate = stage_create(&mut draft, &replacement, today)?;
            self.commit(&mut guard, draft).await?;
            info!(old = %id, new = %rate.id, unit = %old_unit_id, "rate updated");
            return Ok(rate);
        }

        // Moving to another unit: lock both in id order.
        let old_unit = self.get_unit(&old_unit_id).ok_or(EngineError::NotFound(id))?;
        let new_unit = self.unit_or_create(replacement.unit_id)?;
        let (mut old_guard, mut new_guard) = if old_unit_id < replacement.unit_id {
            let old_guard = old_unit.write_owned().await;
            (old_guard, new_unit.write_owned().await)
        } else {
            let new_guard = new_unit.write_owned().await;
            (old_unit.write_owned().await, new_guard)
        };

        let mut old_draft = Draft::new(&old_guard);
        stage_replace(&mut old_draft, id, today)?;
        let mut new_draft = Draft::new(&new_guard);
        let rate = stage_create(&mut new_draft, &replacement, today)?;

        // One record for both units, so a crash never leaves the old rate
        // closed without its replacement.
        self.commit_all([(&mut *old_guard, old_draft), (&mut *new_guard, new_draft)])
            .await?;
        info!(old = %id, new = %rate.id, from = %old_unit_id, to = %rate.unit_id, "rate moved to another unit");
        Ok(rate)
    }

    /// Soft-close: the rate stays on record but stops admitting bookings after `book_to`.
    pub async fn close_rate(&self, id: Ulid, book_to: NaiveDate) -> Result<Rate, EngineError> {
        check_date(book_to)?;
        let _gate = self.write_gate.read().await;
        let (unit_id, mut guard) = self.resolve_rate_write(&id).await?;
        let current = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.is_active() {
            return Err(EngineError::AlreadyClosed(id));
        }
        let closed = current
            .booking
            .close(book_to)
            .ok_or(Rejection::CloseBeforeOpen)?;

        let mut draft = Draft::new(&guard);
        draft.apply(Event::RateClosed { id, unit_id, book_to });
        self.commit(&mut guard, draft).await?;
        info!(rate = %id, unit = %unit_id, "rate closed at {book_to}");
        Ok(Rate {
            booking: closed,
            ..current
        })
    }

    /// Hard delete. Returns the removed record.
    pub async fn delete_rate(&self, id: Ulid) -> Result<Rate, EngineError> {
        let _gate = self.write_gate.read().await;
        let (unit_id, mut guard) = self.resolve_rate_write(&id).await?;
        let removed = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;

        let mut draft = Draft::new(&guard);
        draft.apply(Event::RateDeleted { id, unit_id });
        self.commit(&mut guard, draft).await?;
        info!(rate = %id, unit = %unit_id, "rate deleted");
        Ok(removed)
    }

    /// Run one merge sweep over a unit's active timeline. Returns the number
    /// of merges; an unknown unit has nothing to merge.
    pub async fn merge_adjacent(&self, unit_id: Ulid) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let Some(unit) = self.get_unit(&unit_id) else {
            return Ok(0);
        };
        let mut guard = unit.write().await;
        let mut draft = Draft::new(&guard);
        let merges = merge_adjacent(&mut draft);
        self.commit(&mut guard, draft).await?;
        metrics::counter!(crate::observability::MERGES_TOTAL).increment(merges as u64);
        Ok(merges)
    }

    /// Rewrite the WAL as one `RateAdded` per live record.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Writers hold the gate shared for their whole critical section, so
        // with it held exclusively every unit is at rest.
        let _gate = self.write_gate.write().await;

        let mut unit_ids: Vec<Ulid> = self.units.iter().map(|e| *e.key()).collect();
        unit_ids.sort();

        let mut events = Vec::new();
        for unit_id in &unit_ids {
            let Some(unit) = self.get_unit(unit_id) else {
                continue;
            };
            let guard = unit.read().await;
            events.extend(guard.rates().iter().map(|rate| Event::RateAdded { rate: rate.clone() }));
        }
        let live = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {live} records across {} units", unit_ids.len());
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
