use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Lot or reservation absent (or reservation already closed).
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// No free spot left in the lot.
    NoCapacity(Ulid),
    /// Requester does not own the reservation.
    Forbidden(Ulid),
    CapacityConflict {
        requested: i64,
        occupied: u32,
    },
    /// Lot still has occupied spots.
    Conflict {
        lot_id: Ulid,
        occupied: u32,
    },
    InvalidArgument(&'static str),
    LimitExceeded(&'static str),
    LedgerViolation(String),
    /// The WAL could not commit the operation.
    Unavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NoCapacity(id) => write!(f, "no free spot in lot {id}"),
            EngineError::Forbidden(id) => {
                write!(f, "reservation {id} belongs to another requester")
            }
            EngineError::CapacityConflict { requested, occupied } => write!(
                f,
                "cannot resize to {requested}: {occupied} spots are occupied"
            ),
            EngineError::Conflict { lot_id, occupied } => write!(
                f,
                "cannot delete lot {lot_id}: {occupied} spots are occupied"
            ),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::LedgerViolation(msg) => write!(f, "ledger violation: {msg}"),
            EngineError::Unavailable(e) => write!(f, "unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
