use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ALLOCATIONS_TOTAL, SETTLEMENTS_TOTAL, SETTLED_CENTS_TOTAL};

use super::{lot_from_created, Engine, EngineError, WalCommand};

fn validate_requester(requester: &str) -> Result<(), EngineError> {
    if requester.is_empty() {
        return Err(EngineError::InvalidArgument("requester must not be empty"));
    }
    if requester.len() > MAX_REQUESTER_LEN {
        return Err(EngineError::LimitExceeded("requester identity too long"));
    }
    Ok(())
}

fn validate_new_lot(new: &NewLot) -> Result<(), EngineError> {
    if new.name.trim().is_empty() {
        return Err(EngineError::InvalidArgument("lot name must not be empty"));
    }
    if new.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("lot name too long"));
    }
    if new.address.len() > MAX_ADDRESS_LEN {
        return Err(EngineError::LimitExceeded("address too long"));
    }
    if new.postal_code.len() > MAX_POSTAL_CODE_LEN {
        return Err(EngineError::LimitExceeded("postal code too long"));
    }
    if new.unit_price.is_negative() {
        return Err(EngineError::InvalidArgument("price must not be negative"));
    }
    if new.unit_price > MAX_UNIT_PRICE {
        return Err(EngineError::LimitExceeded("price too large"));
    }
    if new.capacity < 0 {
        return Err(EngineError::InvalidArgument("capacity must not be negative"));
    }
    if new.capacity > MAX_LOT_CAPACITY {
        return Err(EngineError::LimitExceeded("lot capacity too large"));
    }
    Ok(())
}

impl Engine {
    /// Create a lot with `capacity` free spots numbered from 1.
    pub async fn create_lot(&self, new: NewLot) -> Result<LotInfo, EngineError> {
        validate_new_lot(&new)?;
        let _gate = self.commit_gate.read().await;
        if self.state.len() >= MAX_LOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many lots"));
        }

        let capacity = new.capacity as u32;
        let event = Event::LotCreated {
            id: new.id,
            name: new.name,
            address: new.address,
            postal_code: new.postal_code,
            unit_price: new.unit_price,
            spots: (1..=capacity).collect(),
            next_spot: capacity + 1,
        };
        let lot = lot_from_created(&event)
            .ok_or(EngineError::InvalidArgument("not a lot creation"))?;

        // Publish the cell already write-locked so nobody sees it before it is durable.
        let cell = Arc::new(RwLock::new(lot));
        let mut guard = cell.clone().write_owned().await;
        match self.state.entry(new.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(new.id)),
            Entry::Vacant(slot) => {
                slot.insert(cell);
            }
        }
        if let Err(e) = self.persist(&event).await {
            guard.deleted = true;
            self.state.remove(&new.id);
            return Err(e);
        }
        self.notify.send(new.id, &event);
        info!("created lot {} with {capacity} spots", new.id);
        Ok(guard.info())
    }

    /// Occupy the lowest-numbered free spot of `lot_id` for `requester`.
    pub async fn allocate(&self, lot_id: Ulid, requester: &str) -> Result<Reservation, EngineError> {
        validate_requester(requester)?;
        let _gate = self.commit_gate.read().await;
        let mut lot = self.lock_lot(lot_id).await?;

        let Some(spot) = lot.lowest_free_spot() else {
            metrics::counter!(ALLOCATIONS_TOTAL, "outcome" => "no_capacity").increment(1);
            return Err(EngineError::NoCapacity(lot_id));
        };

        let account = self.account_or_default(requester);
        let mut account = account.write().await;
        let id = Ulid::new();
        let event = Event::ReservationOpened {
            id,
            lot_id,
            spot,
            requester: requester.to_string(),
            start: self.clock.now_ms(),
        };
        self.persist_and_apply(&mut lot, Some(&mut *account), &event)
            .await?;

        metrics::counter!(ALLOCATIONS_TOTAL, "outcome" => "ok").increment(1);
        debug!("reservation {id}: {requester} took spot {spot} of lot {lot_id}");
        account
            .open
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::LedgerViolation(format!("reservation {id} not recorded")))
    }

    /// Close an open reservation, charge for the elapsed time and free its spot.
    pub async fn release(&self, reservation_id: Ulid, requester: &str) -> Result<Settlement, EngineError> {
        let _gate = self.commit_gate.read().await;
        let owner = self
            .get_reservation_ref(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if owner.requester != requester {
            return Err(EngineError::Forbidden(reservation_id));
        }

        // A lot with an open reservation cannot be deleted, so a missing lot means closed.
        let mut lot = self
            .lock_lot(owner.lot_id)
            .await
            .map_err(|_| EngineError::NotFound(reservation_id))?;
        let account = self
            .get_account(requester)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let mut account = account.write().await;
        let open = account
            .open
            .get(&reservation_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))?;

        let end = self.clock.now_ms().max(open.start);
        let cost = lot.unit_price.prorate_hourly(end - open.start);
        let history_id = Ulid::new();
        let event = Event::ReservationSettled {
            id: reservation_id,
            lot_id: open.lot_id,
            spot: open.spot,
            requester: requester.to_string(),
            end,
            cost,
            history_id,
        };
        self.persist_and_apply(&mut lot, Some(&mut *account), &event)
            .await?;

        metrics::counter!(SETTLEMENTS_TOTAL).increment(1);
        metrics::counter!(SETTLED_CENTS_TOTAL).increment(cost.cents().max(0) as u64);
        debug!(
            "reservation {reservation_id} settled: spot {} of lot {}, cost {cost}",
            open.spot, open.lot_id
        );
        Ok(Settlement {
            reservation_id,
            history_id,
            lot_id: open.lot_id,
            spot: open.spot,
            requester: open.requester,
            start: open.start,
            end,
            cost,
        })
    }

    /// Grow or shrink a lot. Occupied spots are never removed.
    pub async fn resize_lot(&self, lot_id: Ulid, new_capacity: i64) -> Result<LotInfo, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut lot = self.lock_lot(lot_id).await?;
        let plan = lot.plan_resize(new_capacity)?;
        if plan.is_noop() {
            return Ok(lot.info());
        }

        let event = Event::LotResized {
            id: lot_id,
            capacity: plan.capacity,
            added: plan.added,
            removed: plan.removed,
        };
        let before = lot.capacity;
        self.persist_and_apply(&mut lot, None, &event).await?;
        info!(
            "resized lot {lot_id}: {before} -> {} spots, {} available",
            lot.capacity, lot.available
        );
        Ok(lot.info())
    }

    /// Remove a lot and its spots. Refused while any spot is occupied.
    pub async fn delete_lot(&self, lot_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut lot = self.lock_lot(lot_id).await?;
        let occupied = lot.spots.values().filter(|s| !s.is_free()).count() as u32;
        if occupied > 0 {
            return Err(EngineError::Conflict { lot_id, occupied });
        }

        let event = Event::LotDeleted { id: lot_id };
        self.persist_and_apply(&mut lot, None, &event).await?;
        self.state.remove(&lot_id);
        self.notify.remove(&lot_id);
        info!("deleted lot {lot_id}");
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut lots: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut open = Vec::new();
        let mut snapshots = Vec::with_capacity(lots.len());
        for lot in lots.drain(..) {
            let guard = lot.read().await;
            snapshots.push((guard.id, guard.clone()));
        }
        snapshots.sort_by_key(|(id, _)| *id);
        for (_, lot) in &snapshots {
            events.push(Event::LotCreated {
                id: lot.id,
                name: lot.name.clone(),
                address: lot.address.clone(),
                postal_code: lot.postal_code.clone(),
                unit_price: lot.unit_price,
                spots: lot.spots.keys().copied().collect(),
                next_spot: lot.next_spot,
            });
        }

        let accounts: Vec<_> = self.accounts.iter().map(|e| e.value().clone()).collect();
        for account in accounts {
            let guard = account.read().await;
            for reservation in &guard.closed {
                if let Some(history) = guard
                    .history
                    .iter()
                    .find(|h| h.reservation_id == reservation.id)
                {
                    events.push(Event::ReservationArchived {
                        reservation: reservation.clone(),
                        history: history.clone(),
                    });
                }
            }
            open.extend(guard.open.values().cloned());
        }

        open.sort_by_key(|r| (r.start, r.id));
        for r in open {
            events.push(Event::ReservationOpened {
                id: r.id,
                lot_id: r.lot_id,
                spot: r.spot,
                requester: r.requester,
                start: r.start,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(format!("WAL error: {e}")))
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
