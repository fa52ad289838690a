//! Capacity ledger: the only code that changes spot status or the cached
//! `available` counter. Every transition updates both in the same borrow.

use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::MAX_LOT_CAPACITY;
use crate::model::*;

use super::EngineError;

/// Spots to add and remove to bring a lot to `capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizePlan {
    pub capacity: u32,
    pub added: Vec<SpotId>,
    pub removed: Vec<SpotId>,
}

impl ResizePlan {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl LotState {
    /// Occupied spots as implied by the counters.
    pub fn occupied(&self) -> u32 {
        self.capacity.saturating_sub(self.available)
    }

    pub fn lowest_free_spot(&self) -> Option<SpotId> {
        self.spots
            .iter()
            .find(|(_, status)| status.is_free())
            .map(|(number, _)| *number)
    }

    pub(crate) fn occupy(&mut self, spot: SpotId, reservation_id: Ulid) -> Result<(), EngineError> {
        let status = self.spots.get_mut(&spot).ok_or_else(|| {
            EngineError::LedgerViolation(format!("lot {} has no spot {spot}", self.id))
        })?;
        if !status.is_free() {
            return Err(EngineError::LedgerViolation(format!(
                "spot {spot} of lot {} is already occupied",
                self.id
            )));
        }
        *status = SpotStatus::Occupied { reservation_id };
        self.available -= 1;
        Ok(())
    }

    pub(crate) fn vacate(&mut self, spot: SpotId, reservation_id: Ulid) -> Result<(), EngineError> {
        let status = self.spots.get_mut(&spot).ok_or_else(|| {
            EngineError::LedgerViolation(format!("lot {} has no spot {spot}", self.id))
        })?;
        if *status != (SpotStatus::Occupied { reservation_id }) {
            return Err(EngineError::LedgerViolation(format!(
                "spot {spot} of lot {} is not held by reservation {reservation_id}",
                self.id
            )));
        }
        *status = SpotStatus::Free;
        self.available += 1;
        Ok(())
    }

    /// Decide which spots a resize to `new_capacity` creates or deletes.
    /// Shrinking takes free spots lowest number first and never touches occupied ones.
    pub fn plan_resize(&self, new_capacity: i64) -> Result<ResizePlan, EngineError> {
        if new_capacity < 0 {
            return Err(EngineError::InvalidArgument("capacity must not be negative"));
        }
        if new_capacity > MAX_LOT_CAPACITY {
            return Err(EngineError::LimitExceeded("lot capacity too large"));
        }
        let occupied = self.occupied();
        if new_capacity < occupied as i64 {
            return Err(EngineError::CapacityConflict {
                requested: new_capacity,
                occupied,
            });
        }

        let target = new_capacity as u32;
        let mut plan = ResizePlan {
            capacity: target,
            added: Vec::new(),
            removed: Vec::new(),
        };
        if target > self.capacity {
            let end = self
                .next_spot
                .checked_add(target - self.capacity)
                .ok_or(EngineError::LimitExceeded("spot numbers exhausted"))?;
            plan.added = (self.next_spot..end).collect();
        } else if target < self.capacity {
            plan.removed = self
                .spots
                .iter()
                .filter(|(_, status)| status.is_free())
                .map(|(number, _)| *number)
                .take((self.capacity - target) as usize)
                .collect();
        }
        Ok(plan)
    }

    pub(crate) fn apply_resize(
        &mut self,
        capacity: u32,
        added: &[SpotId],
        removed: &[SpotId],
    ) -> Result<(), EngineError> {
        if let Some(busy) = removed
            .iter()
            .find(|n| self.spots.get(n).is_some_and(|s| !s.is_free()))
        {
            return Err(EngineError::LedgerViolation(format!(
                "resize of lot {} would delete occupied spot {busy}",
                self.id
            )));
        }
        for number in removed {
            self.spots.remove(number);
        }
        for number in added {
            self.spots.insert(*number, SpotStatus::Free);
            self.next_spot = self.next_spot.max(number.saturating_add(1));
        }
        let occupied = self.spots.values().filter(|s| !s.is_free()).count() as u32;
        self.capacity = capacity;
        self.available = capacity.saturating_sub(occupied);
        Ok(())
    }

    /// Check the counters against the spots.
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        let violation = |msg: String| -> Result<(), EngineError> {
            Err(EngineError::LedgerViolation(format!("lot {}: {msg}", self.id)))
        };

        if self.available > self.capacity {
            return violation(format!(
                "available {} exceeds capacity {}",
                self.available, self.capacity
            ));
        }
        if self.spots.len() != self.capacity as usize {
            return violation(format!(
                "capacity {} but {} spots",
                self.capacity,
                self.spots.len()
            ));
        }
        let free = self.spots.values().filter(|s| s.is_free()).count();
        if free != self.available as usize {
            return violation(format!("available {} but {free} free spots", self.available));
        }
        if let Some((last, _)) = self.spots.last_key_value()
            && *last >= self.next_spot
        {
            return violation(format!("spot {last} not below next_spot {}", self.next_spot));
        }
        let mut holders = HashSet::new();
        for status in self.spots.values() {
            if let SpotStatus::Occupied { reservation_id } = status
                && !holders.insert(*reservation_id)
            {
                return violation(format!("reservation {reservation_id} holds two spots"));
            }
        }
        Ok(())
    }
}
