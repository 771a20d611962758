//! Single-active-node election over a shared PostgreSQL table.
//!
//! Every node that wants to run a cluster singleton builds a [`RowLock`] for
//! the same table and cluster id, calls [`RowLock::acquire`] until it returns
//! `true`, polls [`RowLock::is_held`] while it performs the singleton work and
//! calls [`RowLock::release`] on shutdown. Exclusivity comes from the
//! database's row lock on the cluster's single row; retry cadence is left to
//! the caller.
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use rowlock_core::{LockConfig, RowLock};
//!
//! # fn main() -> Result<(), rowlock_core::LockError> {
//! let options: HashMap<String, String> = [
//!     ("endpoint", "postgresql://postgres@localhost/app"),
//!     ("driverIdentity", "postgres"),
//!     ("tableName", "node_lock"),
//!     ("clusterId", "scheduler"),
//!     ("contentionTimeoutSeconds", "5"),
//! ]
//! .iter()
//! .map(|(k, v)| (k.to_string(), v.to_string()))
//! .collect();
//!
//! let mut lock = RowLock::new(LockConfig::from_map(&options)?)?;
//! if lock.acquire()? {
//!     while lock.is_held() {
//!         // singleton work
//!         # break;
//!     }
//! }
//! lock.release();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod memory;
pub mod postgres;
pub mod sql;
pub mod store;

pub use config::{DriverKind, LockConfig, SslMode};
pub use error::{DriverError, LockError};
pub use lock::{InterruptHandle, LockState, RowLock};
