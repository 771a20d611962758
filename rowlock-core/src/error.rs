use thiserror::Error;

/// Errors surfaced to callers of [`crate::RowLock`].
///
/// Contention is not an error: `acquire()` reports it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid lock configuration: {0}")]
    Configuration(String),
    #[error("lock storage unavailable: {0}")]
    StorageUnavailable(#[source] DriverError),
    #[error("lock storage error: {0}")]
    Storage(#[source] DriverError),
}

/// Failures reported by a [`crate::store::LockConnection`].
#[derive(Debug, Error)]
pub enum DriverError {
    /// The row lock could not be obtained within the wait budget.
    #[error("timed out waiting for the row lock")]
    LockTimeout,
    #[error("table {0} does not exist")]
    UndefinedTable(String),
    #[error("statement cancelled")]
    Cancelled,
    #[error("connection closed")]
    Closed,
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
}
