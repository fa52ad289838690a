use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Spot number, unique within its lot. Assigned from a per-lot counter, never reused.
pub type SpotId = u32;

pub const MS_PER_HOUR: Ms = 3_600_000;

/// An amount of money in minor units (cents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Charge for `elapsed_ms` at `self` per hour, rounded half-up to the cent.
    /// Negative durations charge nothing.
    pub fn prorate_hourly(self, elapsed_ms: Ms) -> Money {
        let elapsed = elapsed_ms.max(0) as i128;
        let numerator = self.0 as i128 * elapsed;
        let denominator = MS_PER_HOUR as i128;
        let rounded = if numerator >= 0 {
            (numerator + denominator / 2) / denominator
        } else {
            (numerator - denominator / 2) / denominator
        };
        Money(rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMoneyError(String);

impl fmt::Display for ParseMoneyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid amount: {}", self.0)
    }
}

impl std::error::Error for ParseMoneyError {}

impl FromStr for Money {
    type Err = ParseMoneyError;

    /// Accepts `"20"`, `"20.5"`, `"20.50"`, `"-3.25"`. At most two fractional digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMoneyError(s.to_string());
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (units, fraction) = match digits.split_once('.') {
            Some((u, f)) => (u, f),
            None => (digits, ""),
        };
        if units.is_empty()
            || fraction.len() > 2
            || !units.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }
        let units: i64 = units.parse().map_err(|_| err())?;
        let mut cents: i64 = if fraction.is_empty() { 0 } else { fraction.parse().map_err(|_| err())? };
        if fraction.len() == 1 {
            cents *= 10;
        }
        let total = units
            .checked_mul(100)
            .and_then(|u| u.checked_add(cents))
            .ok_or_else(err)?;
        Ok(Money(if negative { -total } else { total }))
    }
}

/// Occupancy of a single spot. An occupied spot names the one open reservation holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpotStatus {
    Free,
    Occupied { reservation_id: Ulid },
}

impl SpotStatus {
    pub fn is_free(&self) -> bool {
        matches!(self, SpotStatus::Free)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SpotStatus::Free => "free",
            SpotStatus::Occupied { .. } => "occupied",
        }
    }
}

/// In-memory state of one lot: descriptive fields, the cached counters and its spots.
#[derive(Debug, Clone)]
pub struct LotState {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub postal_code: String,
    /// Price per hour.
    pub unit_price: Money,
    /// Target spot count. Equals `spots.len()` at rest.
    pub capacity: u32,
    /// Cached number of free spots.
    pub available: u32,
    /// Spots keyed by number, so iteration is lowest-number-first.
    pub spots: BTreeMap<SpotId, SpotStatus>,
    /// Next number handed out when the lot grows.
    pub next_spot: SpotId,
    /// Set under the write lock when the lot is deleted, before it leaves the map.
    pub deleted: bool,
}

impl LotState {
    pub fn new(
        id: Ulid,
        name: String,
        address: String,
        postal_code: String,
        unit_price: Money,
        spots: &[SpotId],
        next_spot: SpotId,
    ) -> Self {
        let spots: BTreeMap<SpotId, SpotStatus> =
            spots.iter().map(|n| (*n, SpotStatus::Free)).collect();
        let capacity = spots.len() as u32;
        Self {
            id,
            name,
            address,
            postal_code,
            unit_price,
            capacity,
            available: capacity,
            spots,
            next_spot,
            deleted: false,
        }
    }

    pub fn info(&self) -> LotInfo {
        LotInfo {
            id: self.id,
            name: self.name.clone(),
            address: self.address.clone(),
            postal_code: self.postal_code.clone(),
            unit_price: self.unit_price,
            capacity: self.capacity,
            available: self.available,
        }
    }
}

/// A claim on a spot. Open while `end` is `None`; closed reservations are kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub spot: SpotId,
    pub requester: String,
    pub start: Ms,
    pub end: Option<Ms>,
    pub cost: Option<Money>,
}

impl Reservation {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// Immutable archive entry written once per settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub lot_id: Ulid,
    pub spot: SpotId,
    pub requester: String,
    pub start: Ms,
    pub end: Ms,
    pub cost: Money,
}

/// Everything owned by one requester identity.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub open: BTreeMap<Ulid, Reservation>,
    pub closed: Vec<Reservation>,
    pub history: Vec<HistoryRecord>,
}

/// Where a reservation lives: its lot (for the spot) and its owner (for the account).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRef {
    pub lot_id: Ulid,
    pub requester: String,
}

/// Input for lot creation. Capacity is signed so negative requests can be rejected explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLot {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub postal_code: String,
    pub unit_price: Money,
    pub capacity: i64,
}

/// Domain events, flat except for archived snapshots. Also the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LotCreated {
        id: Ulid,
        name: String,
        address: String,
        postal_code: String,
        unit_price: Money,
        spots: Vec<SpotId>,
        next_spot: SpotId,
    },
    LotResized {
        id: Ulid,
        capacity: u32,
        added: Vec<SpotId>,
        removed: Vec<SpotId>,
    },
    LotDeleted {
        id: Ulid,
    },
    ReservationOpened {
        id: Ulid,
        lot_id: Ulid,
        spot: SpotId,
        requester: String,
        start: Ms,
    },
    ReservationSettled {
        id: Ulid,
        lot_id: Ulid,
        spot: SpotId,
        requester: String,
        end: Ms,
        cost: Money,
        history_id: Ulid,
    },
    /// Closed reservation plus its history entry, written by compaction only.
    ReservationArchived {
        reservation: Reservation,
        history: HistoryRecord,
    },
}

impl Event {
    /// The lot whose state this event touches, if any.
    pub fn lot_id(&self) -> Option<Ulid> {
        match self {
            Event::LotCreated { id, .. }
            | Event::LotResized { id, .. }
            | Event::LotDeleted { id } => Some(*id),
            Event::ReservationOpened { lot_id, .. } | Event::ReservationSettled { lot_id, .. } => {
                Some(*lot_id)
            }
            Event::ReservationArchived { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotInfo {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub postal_code: String,
    pub unit_price: Money,
    pub capacity: u32,
    pub available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotInfo {
    pub lot_id: Ulid,
    pub number: SpotId,
    pub status: SpotStatus,
}

/// Result of closing a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub reservation_id: Ulid,
    pub history_id: Ulid,
    pub lot_id: Ulid,
    pub spot: SpotId,
    pub requester: String,
    pub start: Ms,
    pub end: Ms,
    pub cost: Money,
}
