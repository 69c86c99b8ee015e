use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::pricing::quote_stay;
use super::{Engine, EngineError, SharedUnitState};

impl Engine {
    pub async fn get_rate(&self, id: Ulid) -> Result<Rate, EngineError> {
        let unit_id = self.unit_for_rate(&id).ok_or(EngineError::NotFound(id))?;
        let unit = self.get_unit(&unit_id).ok_or(EngineError::NotFound(id))?;
        let guard = unit.read().await;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every record of one unit, active and closed, in stay order.
    pub async fn list_unit_rates(&self, unit_id: Ulid) -> Vec<Rate> {
        let Some(unit) = self.get_unit(&unit_id) else {
            return Vec::new();
        };
        let guard = unit.read().await;
        guard.rates().to_vec()
    }

    pub async fn active_rates(&self, unit_id: Ulid) -> Vec<Rate> {
        let Some(unit) = self.get_unit(&unit_id) else {
            return Vec::new();
        };
        let guard = unit.read().await;
        guard.active().cloned().collect()
    }

    /// All records, grouped by unit (units in id order, each in stay order).
    pub async fn list_rates(&self) -> Vec<Rate> {
        let mut units: Vec<(Ulid, SharedUnitState)> = self
            .units
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        units.sort_by_key(|(id, _)| *id);

        let mut rates = Vec::new();
        for (_, unit) in units {
            let guard = unit.read().await;
            rates.extend_from_slice(guard.rates());
        }
        rates
    }

    /// Price the nights `[arrival, departure)` as seen by a booking made on
    /// `booking_date`.
    pub async fn quote(
        &self,
        unit_id: Ulid,
        arrival: NaiveDate,
        departure: NaiveDate,
        booking_date: NaiveDate,
    ) -> Result<f64, EngineError> {
        metrics::counter!(crate::observability::QUOTES_TOTAL).increment(1);
        match self.get_unit(&unit_id) {
            Some(unit) => {
                let guard = unit.read().await;
                quote_stay(guard.rates(), arrival, departure, booking_date)
            }
            None => quote_stay(&[], arrival, departure, booking_date),
        }
    }
}
