//! Driver seam between [`crate::RowLock`] and the database.
//!
//! A [`LockConnection`] is one dedicated database session. The lock keeps it
//! open, inside an uncommitted transaction, for as long as it holds the row,
//! so implementations must never share the underlying session.

use std::time::Duration;

use crate::error::DriverError;

/// How long a locking read may queue behind another holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Fail with [`DriverError::LockTimeout`] immediately if the row is taken.
    NoWait,
    /// Fail with [`DriverError::LockTimeout`] once the budget is spent.
    Bounded(Duration),
}

impl LockWait {
    /// A zero budget means "do not wait" rather than "wait forever".
    pub fn from_timeout(timeout: Duration) -> Self {
        if timeout.is_zero() {
            LockWait::NoWait
        } else {
            LockWait::Bounded(timeout)
        }
    }
}

/// Opens dedicated connections for one lock table.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn LockConnection>, DriverError>;
}

/// Aborts whatever statement a connection is currently running.
pub trait Canceller: Send + Sync {
    fn cancel(&self) -> Result<(), DriverError>;
}

/// One database session bound to a lock table.
pub trait LockConnection: Send {
    /// Start a transaction; autocommit is off until commit or rollback.
    fn begin(&mut self) -> Result<(), DriverError>;

    fn commit(&mut self) -> Result<(), DriverError>;

    fn rollback(&mut self) -> Result<(), DriverError>;

    fn close(self: Box<Self>) -> Result<(), DriverError>;

    fn is_closed(&self) -> bool;

    /// Serialize schema bootstrap across processes for the rest of the
    /// current transaction.
    fn guard_schema(&mut self) -> Result<(), DriverError>;

    fn create_table(&mut self) -> Result<(), DriverError>;

    /// Plain read of every marker stored for `cluster_id`.
    ///
    /// Fails with [`DriverError::UndefinedTable`] if the table is missing.
    fn read_markers(&mut self, cluster_id: &str) -> Result<Vec<i64>, DriverError>;

    fn insert_row(&mut self, cluster_id: &str, marker: i64) -> Result<(), DriverError>;

    /// Row-exclusive locking read; returns how many rows were locked.
    fn lock_rows(&mut self, cluster_id: &str, wait: LockWait) -> Result<usize, DriverError>;

    /// Set `owner_marker` on the rows for `cluster_id`; returns rows updated.
    fn touch(&mut self, cluster_id: &str, marker: i64) -> Result<u64, DriverError>;

    /// Whether the transaction that wrote the marker is still open.
    fn holds_transaction(&mut self) -> Result<bool, DriverError>;

    fn canceller(&self) -> Option<Box<dyn Canceller>>;
}
