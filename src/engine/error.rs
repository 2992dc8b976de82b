use chrono::NaiveDate;
use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Caller does not own the item the operation targets.
    Forbidden(Ulid),
    InsufficientStock {
        item_id: Ulid,
        requested: u32,
        available: i64,
    },
    InvalidRange {
        start: NaiveDate,
        end: NaiveDate,
    },
    InvalidQuantity(u32),
    InvalidItem(&'static str),
    /// Rental already ended or confirmed.
    AlreadyTerminal(Ulid),
    HasActiveRentals(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Forbidden(id) => write!(f, "not the owner of item {id}"),
            EngineError::InsufficientStock {
                item_id,
                requested,
                available,
            } => write!(
                f,
                "item {item_id} not available for requested quantity/dates: requested {requested}, available {available}"
            ),
            EngineError::InvalidRange { start, end } => {
                write!(f, "invalid date range [{start}, {end}]: end must be after start")
            }
            EngineError::InvalidQuantity(q) => write!(f, "invalid quantity {q}: must be positive"),
            EngineError::InvalidItem(msg) => write!(f, "invalid item: {msg}"),
            EngineError::AlreadyTerminal(id) => {
                write!(f, "rental {id} is no longer active")
            }
            EngineError::HasActiveRentals(id) => {
                write!(f, "cannot delete item {id}: has active rentals")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
