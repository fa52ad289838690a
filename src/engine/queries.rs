use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_lot(&self, lot_id: Ulid) -> Result<LotInfo, EngineError> {
        let lot = self
            .get_lot_state(&lot_id)
            .ok_or(EngineError::NotFound(lot_id))?;
        let guard = lot.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(lot_id));
        }
        Ok(guard.info())
    }

    /// All lots, ordered by id.
    pub async fn list_lots(&self) -> Vec<LotInfo> {
        let lots: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(lots.len());
        for lot in lots {
            let guard = lot.read().await;
            if !guard.deleted {
                infos.push(guard.info());
            }
        }
        infos.sort_by_key(|l| l.id);
        infos
    }

    /// Spots of a lot, lowest number first.
    pub async fn list_spots(&self, lot_id: Ulid) -> Result<Vec<SpotInfo>, EngineError> {
        let lot = self
            .get_lot_state(&lot_id)
            .ok_or(EngineError::NotFound(lot_id))?;
        let guard = lot.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(lot_id));
        }
        Ok(guard
            .spots
            .iter()
            .map(|(number, status)| SpotInfo {
                lot_id,
                number: *number,
                status: *status,
            })
            .collect())
    }

    /// A reservation, open or closed.
    pub async fn get_reservation(&self, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        let owner = self
            .get_reservation_ref(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let account = self
            .get_account(&owner.requester)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let guard = account.read().await;
        guard
            .open
            .get(&reservation_id)
            .or_else(|| guard.closed.iter().find(|r| r.id == reservation_id))
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))
    }

    /// Open reservations of `requester`, oldest first.
    pub async fn list_open_reservations_for(&self, requester: &str) -> Vec<Reservation> {
        let Some(account) = self.get_account(requester) else {
            return Vec::new();
        };
        let guard = account.read().await;
        let mut open: Vec<Reservation> = guard.open.values().cloned().collect();
        open.sort_by_key(|r| (r.start, r.id));
        open
    }

    /// Settlement history of `requester`, in settlement order.
    pub async fn list_history_for(&self, requester: &str) -> Vec<HistoryRecord> {
        match self.get_account(requester) {
            Some(account) => account.read().await.history.clone(),
            None => Vec::new(),
        }
    }

    /// Check a lot's counters against its spots, and every occupied spot against
    /// the open reservation that should be holding it.
    pub async fn verify_lot(&self, lot_id: Ulid) -> Result<(), EngineError> {
        let lot = self
            .get_lot_state(&lot_id)
            .ok_or(EngineError::NotFound(lot_id))?;
        let guard = lot.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(lot_id));
        }
        guard.check_invariants()?;

        for (number, status) in &guard.spots {
            let SpotStatus::Occupied { reservation_id } = status else {
                continue;
            };
            let owner = self.get_reservation_ref(reservation_id).ok_or_else(|| {
                EngineError::LedgerViolation(format!(
                    "spot {number} of lot {lot_id} held by unknown reservation {reservation_id}"
                ))
            })?;
            let account = self.get_account(&owner.requester).ok_or_else(|| {
                EngineError::LedgerViolation(format!("no account for {}", owner.requester))
            })?;
            let account = account.read().await;
            match account.open.get(reservation_id) {
                Some(r) if r.lot_id == lot_id && r.spot == *number => {}
                _ => {
                    return Err(EngineError::LedgerViolation(format!(
                        "spot {number} of lot {lot_id} points at reservation {reservation_id}, which is not open there"
                    )));
                }
            }
        }
        Ok(())
    }
}
