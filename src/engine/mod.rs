mod error;
mod ledger;
mod mutations;
mod queries;

pub use error::EngineError;
pub use ledger::ResizePlan;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, warn};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::limits::MAX_COMMIT_ATTEMPTS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLotState = Arc<RwLock<LotState>>;
pub type SharedAccount = Arc<RwLock<Account>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            commit_batch(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    commit_batch(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

/// The whole batch becomes durable or none of it does: every sender gets the same answer.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        error!("WAL rollback after failed batch: {e}");
    }
    result
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
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
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedLotState>,
    pub notify: Arc<NotifyHub>,
    pub(crate) accounts: DashMap<String, SharedAccount>,
    /// Reservation id → (lot, owner), for open and closed reservations.
    pub(crate) reservation_index: DashMap<Ulid, ReservationRef>,
    pub(crate) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared across their WAL append; compaction holds it exclusively.
    pub(crate) commit_gate: RwLock<()>,
    pub(crate) clock: Arc<dyn Clock>,
}

/// Apply an event to a lot. The caller holds the lot write lock.
fn apply_to_lot(lot: &mut LotState, event: &Event) {
    let result = match event {
        Event::LotResized {
            capacity,
            added,
            removed,
            ..
        } => lot.apply_resize(*capacity, added, removed),
        Event::LotDeleted { .. } => {
            lot.deleted = true;
            Ok(())
        }
        Event::ReservationOpened { id, spot, .. } => lot.occupy(*spot, *id),
        Event::ReservationSettled { id, spot, .. } => lot.vacate(*spot, *id),
        // LotCreated is handled at the map level; archives only touch accounts
        Event::LotCreated { .. } | Event::ReservationArchived { .. } => Ok(()),
    };
    if let Err(e) = result {
        error!("failed to apply {event:?}: {e}");
    }
    debug_assert!(
        lot.deleted || lot.check_invariants().is_ok(),
        "ledger drifted after {event:?}"
    );
}

/// Apply an event to the owning requester's account (caller holds its write lock).
fn apply_to_account(account: &mut Account, event: &Event) {
    match event {
        Event::ReservationOpened {
            id,
            lot_id,
            spot,
            requester,
            start,
        } => {
            account.open.insert(
                *id,
                Reservation {
                    id: *id,
                    lot_id: *lot_id,
                    spot: *spot,
                    requester: requester.clone(),
                    start: *start,
                    end: None,
                    cost: None,
                },
            );
        }
        Event::ReservationSettled {
            id,
            end,
            cost,
            history_id,
            ..
        } => {
            let Some(mut reservation) = account.open.remove(id) else {
                return;
            };
            reservation.end = Some(*end);
            reservation.cost = Some(*cost);
            account.history.push(HistoryRecord {
                id: *history_id,
                reservation_id: reservation.id,
                lot_id: reservation.lot_id,
                spot: reservation.spot,
                requester: reservation.requester.clone(),
                start: reservation.start,
                end: *end,
                cost: *cost,
            });
            account.closed.push(reservation);
        }
        Event::ReservationArchived {
            reservation,
            history,
        } => {
            account.closed.push(reservation.clone());
            account.history.push(history.clone());
        }
        Event::LotCreated { .. } | Event::LotResized { .. } | Event::LotDeleted { .. } => {}
    }
}

/// The requester whose account an event touches, if any.
fn event_requester(event: &Event) -> Option<&str> {
    match event {
        Event::ReservationOpened { requester, .. } | Event::ReservationSettled { requester, .. } => {
            Some(requester)
        }
        Event::ReservationArchived { reservation, .. } => Some(&reservation.requester),
        Event::LotCreated { .. } | Event::LotResized { .. } | Event::LotDeleted { .. } => None,
    }
}

fn index_reservation(index: &DashMap<Ulid, ReservationRef>, event: &Event) {
    match event {
        Event::ReservationOpened {
            id,
            lot_id,
            requester,
            ..
        } => {
            index.insert(
                *id,
                ReservationRef {
                    lot_id: *lot_id,
                    requester: requester.clone(),
                },
            );
        }
        Event::ReservationArchived { reservation, .. } => {
            index.insert(
                reservation.id,
                ReservationRef {
                    lot_id: reservation.lot_id,
                    requester: reservation.requester.clone(),
                },
            );
        }
        _ => {}
    }
}

pub(crate) fn lot_from_created(event: &Event) -> Option<LotState> {
    match event {
        Event::LotCreated {
            id,
            name,
            address,
            postal_code,
            unit_price,
            spots,
            next_spot,
        } => Some(LotState::new(
            *id,
            name.clone(),
            address.clone(),
            postal_code.clone(),
            *unit_price,
            spots,
            *next_spot,
        )),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Replay into plain maps first; nothing is shared yet, so no locks are needed.
        let mut lots: HashMap<Ulid, LotState> = HashMap::new();
        let mut accounts: HashMap<String, Account> = HashMap::new();
        let reservation_index = DashMap::new();

        for event in &events {
            match event {
                Event::LotCreated { id, .. } => {
                    if let Some(lot) = lot_from_created(event) {
                        lots.insert(*id, lot);
                    }
                }
                Event::LotDeleted { id } => {
                    lots.remove(id);
                }
                other => {
                    if let Some(lot_id) = other.lot_id()
                        && let Some(lot) = lots.get_mut(&lot_id)
                    {
                        apply_to_lot(lot, other);
                    }
                    if let Some(requester) = event_requester(other) {
                        let account = accounts.entry(requester.to_string()).or_default();
                        apply_to_account(account, other);
                    }
                    index_reservation(&reservation_index, other);
                }
            }
        }

        let engine = Self {
            state: lots
                .into_iter()
                .map(|(id, lot)| (id, Arc::new(RwLock::new(lot))))
                .collect(),
            notify,
            accounts: accounts
                .into_iter()
                .map(|(who, account)| (who, Arc::new(RwLock::new(account))))
                .collect(),
            reservation_index,
            wal_tx,
            commit_gate: RwLock::new(()),
            clock,
        };

        Ok(engine)
    }

    /// Hand one event to the group-commit writer and wait for it to be durable.
    async fn wal_submit(&self, event: &Event) -> Result<io::Result<()>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))
    }

    /// Write event to WAL, retrying I/O failures a bounded number of times.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let mut attempt = 1;
        loop {
            match self.wal_submit(event).await? {
                Ok(()) => return Ok(()),
                Err(e) if attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!("WAL append failed (attempt {attempt}/{MAX_COMMIT_ATTEMPTS}): {e}");
                    attempt += 1;
                }
                Err(e) => return Err(EngineError::Unavailable(format!("WAL error: {e}"))),
            }
        }
    }

    pub fn get_lot_state(&self, id: &Ulid) -> Option<SharedLotState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_reservation_ref(&self, id: &Ulid) -> Option<ReservationRef> {
        self.reservation_index.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn get_account(&self, requester: &str) -> Option<SharedAccount> {
        self.accounts.get(requester).map(|e| e.value().clone())
    }

    pub(crate) fn account_or_default(&self, requester: &str) -> SharedAccount {
        self.accounts
            .entry(requester.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// WAL-append + apply + notify in one call. The caller holds the lot's write lock
    /// and, for reservation events, the owner's account write lock.
    pub(crate) async fn persist_and_apply(
        &self,
        lot: &mut LotState,
        account: Option<&mut Account>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_lot(lot, event);
        if let Some(account) = account {
            apply_to_account(account, event);
        }
        index_reservation(&self.reservation_index, event);
        self.notify.send(lot.id, event);
        Ok(())
    }

    /// Append an event that touches no lot or account state (lot creation).
    pub(crate) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await
    }

    /// Acquire the write lock of a live lot.
    pub(crate) async fn lock_lot(
        &self,
        lot_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<LotState>, EngineError> {
        let lot = self
            .get_lot_state(&lot_id)
            .ok_or(EngineError::NotFound(lot_id))?;
        let guard = lot.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(lot_id));
        }
        Ok(guard)
    }
}
