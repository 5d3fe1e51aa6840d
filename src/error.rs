//! Error types shared across the node runtime.
//!
//! Each component owns one enum so callers can match on the failure class
//! that matters to them (most importantly: ledger network absence).

use thiserror::Error;

/// Failures raised by a single sensor. Never fatal to a request.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor {sensor} failed to initialize: {reason}")]
    Init { sensor: String, reason: String },

    #[error("sensor {sensor} failed identity verification: {reason}")]
    Verify { sensor: String, reason: String },

    #[error("sensor {sensor} harvest failed: {reason}")]
    Harvest { sensor: String, reason: String },

    #[error("sensor {sensor} harvest timed out")]
    Timeout { sensor: String },

    #[error("sensor {sensor} harvest canceled")]
    Canceled { sensor: String },

    #[error("sensor {sensor} failed to close: {reason}")]
    Close { sensor: String, reason: String },

    #[error("bus error: {0}")]
    Bus(String),
}

/// Failures raised while delivering events.
#[derive(Debug, Error)]
pub enum EventError {
    /// The handler received a payload of a shape it does not understand.
    #[error("incorrect payload on topic {topic}: expected {expected}")]
    IncorrectPayload { topic: String, expected: &'static str },

    #[error("event handler failed: {0}")]
    Handler(String),

    #[error("event bus is closed")]
    Closed,
}

/// Failures returned by the ledger client.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger could not be reached at all (no route, discovery failed,
    /// connection refused, timeout). Routed to failover, never fatal.
    #[error("ledger unreachable: {0}")]
    NetworkAbsent(String),

    #[error("not found on ledger: {0}")]
    NotFound(String),

    #[error("ledger rejected request: {0}")]
    Rejected(String),

    #[error("ledger error: {0}")]
    Other(String),
}

impl LedgerError {
    pub fn is_network_absence(&self) -> bool {
        matches!(self, LedgerError::NetworkAbsent(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound(_))
    }
}

/// Failures of the durable reading queue.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Join(String),
}

macro_rules! store_error_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for StoreError {
            fn from(e: $ty) -> Self {
                StoreError::Storage(redb::Error::from(e))
            }
        })*
    };
}

store_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

/// Precondition failures of the guarded device writers. No mutation happens
/// when one of these is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("device is not logged in")]
    NotLoggedIn,

    #[error("update would not change anything")]
    NoChange,

    #[error("specs must name at least one supported metric")]
    NoMetrics,

    #[error("specs must carry a hostname and an ip address")]
    MissingNetworkIdentity,

    #[error("location requires both coordinates to be non-zero")]
    InvalidLocation,

    #[error("battery level {0} is out of range")]
    InvalidBattery(u8),
}

/// Errors surfaced by module setup and teardown.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {module} setup failed: {reason}")]
    Setup { module: &'static str, reason: String },

    #[error("module {module} close failed: {reason}")]
    Close { module: &'static str, reason: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("identity file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Guarded writer result: either a validation refusal or a ledger failure.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
