mod error;
mod mutations;
mod pricing;
mod queries;
mod timeline;
mod validate;

pub use error::{EngineError, Rejection};
pub use pricing::quote_stay;
pub use timeline::{active_disjoint, merge_adjacent, split_overlapping, Draft};
pub use validate::{normalize, today, validate_new_rate};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedUnitState = Arc<RwLock<UnitState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                // Compaction must see everything queued ahead of it on disk.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so stale buffered bytes never ride
    // along with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub units: DashMap<Ulid, SharedUnitState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: rate id → unit id.
    pub(super) rate_to_unit: DashMap<Ulid, Ulid>,
    /// Shared by mutations, exclusive for compaction.
    pub(super) write_gate: RwLock<()>,
}

/// Keep the rate → unit index in step with a committed event.
fn index_event(index: &DashMap<Ulid, Ulid>, event: &Event) {
    match event {
        Event::RateAdded { rate } => {
            index.insert(rate.id, rate.unit_id);
        }
        Event::RateDeleted { id, .. } => {
            index.remove(id);
        }
        Event::RateClosed { .. } => {}
        Event::Batch { events, .. } => {
            for e in events {
                index_event(index, e);
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Replay into plain maps first; nothing else can see these units yet.
        let rate_to_unit = DashMap::new();
        let mut units: HashMap<Ulid, UnitState> = HashMap::new();
        for event in &events {
            for unit_id in event.units() {
                units
                    .entry(unit_id)
                    .or_insert_with(|| UnitState::new(unit_id))
                    .apply(event);
            }
            index_event(&rate_to_unit, event);
        }

        let rate_count = rate_to_unit.len();
        let unit_count = units.len();
        let engine = Self {
            units: units
                .into_iter()
                .map(|(id, unit)| (id, Arc::new(RwLock::new(unit))))
                .collect(),
            wal_tx,
            rate_to_unit,
            write_gate: RwLock::new(()),
        };
        tracing::info!(
            "replayed {} WAL events: {unit_count} units, {rate_count} rates",
            events.len()
        );

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_unit(&self, id: &Ulid) -> Option<SharedUnitState> {
        self.units.get(id).map(|e| e.value().clone())
    }

    pub fn unit_for_rate(&self, rate_id: &Ulid) -> Option<Ulid> {
        self.rate_to_unit.get(rate_id).map(|e| *e.value())
    }

    /// Existing unit lock, or a fresh empty unit registered on first use.
    pub(super) fn unit_or_create(&self, id: Ulid) -> Result<SharedUnitState, EngineError> {
        if let Some(unit) = self.get_unit(&id) {
            return Ok(unit);
        }
        if self.units.len() >= crate::limits::MAX_UNITS {
            return Err(EngineError::LimitExceeded("too many units"));
        }
        let unit = self
            .units
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(UnitState::new(id))));
        Ok(unit.value().clone())
    }

    /// Lookup rate → unit, get the unit, acquire its write lock.
    pub(super) async fn resolve_rate_write(
        &self,
        rate_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<UnitState>), EngineError> {
        let unit_id = self
            .unit_for_rate(rate_id)
            .ok_or(EngineError::NotFound(*rate_id))?;
        let unit = self
            .get_unit(&unit_id)
            .ok_or(EngineError::NotFound(*rate_id))?;
        let guard = unit.write_owned().await;
        Ok((unit_id, guard))
    }

    /// Persist a staged edit as one WAL record, then publish it.
    ///
    /// The caller holds the unit's write lock for the whole call. Until the
    /// append succeeds nothing is visible; on failure the draft is dropped and
    /// the unit keeps its previous timeline.
    pub(super) async fn commit(&self, unit: &mut UnitState, draft: Draft) -> Result<(), EngineError> {
        self.commit_all([(unit, draft)]).await
    }

    /// Persist staged edits to several units as a single WAL record, then
    /// publish all of them. Either every unit moves to its draft or none does.
    pub(super) async fn commit_all<const N: usize>(
        &self,
        staged: [(&mut UnitState, Draft); N],
    ) -> Result<(), EngineError> {
        let Some(first) = staged.first().map(|(_, draft)| draft.unit_id()) else {
            return Ok(());
        };
        let mut events: Vec<Event> = staged
            .iter()
            .flat_map(|(_, draft)| draft.events.iter().cloned())
            .collect();
        let event = match events.len() {
            0 => return Ok(()),
            1 => events.remove(0),
            _ => Event::Batch {
                unit_id: first,
                events,
            },
        };
        self.wal_append(&event).await?;
        index_event(&self.rate_to_unit, &event);
        for (unit, draft) in staged {
            *unit = draft.state;
        }
        Ok(())
    }
}
