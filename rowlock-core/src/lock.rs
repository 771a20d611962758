//! Leader election over a single database row.
//!
//! Holding the lock means holding an open, uncommitted transaction that has
//! row-locked the cluster's row with `SELECT ... FOR UPDATE`. Committing or
//! rolling back that transaction, or losing the connection, gives the row up,
//! so the session's connection is never used for anything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{DriverKind, LockConfig};
use crate::error::{DriverError, LockError};
use crate::memory::MemoryDatabase;
use crate::postgres::PostgresConnector;
use crate::store::{Canceller, Connector, LockConnection, LockWait};

/// Ownership as last confirmed by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unheld,
    Held,
    /// A connection is open but does not hold the row.
    Unknown,
}

struct LockSession {
    connection: Box<dyn LockConnection>,
    state: LockState,
}

fn now_marker() -> i64 {
    Utc::now().timestamp_millis()
}

/// Interrupts `acquire()` from another thread.
///
/// An interrupt is sticky: it cancels the locking read if one is running and
/// otherwise fails the next `acquire()` before it waits. The interrupted call
/// returns [`LockError::Storage`], never `Ok(false)`.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    inner: Arc<InterruptState>,
}

#[derive(Default)]
struct InterruptState {
    pending: AtomicBool,
    canceller: Mutex<Option<Arc<dyn Canceller>>>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        let canceller = self
            .inner
            .canceller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(canceller) = canceller {
            if let Err(err) = canceller.cancel() {
                warn!(error = %err, "failed to cancel lock statement");
            }
        }
    }

    /// Whether an interrupt is waiting to be observed by `acquire()`.
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst)
    }

    fn take_pending(&self) -> bool {
        self.inner.pending.swap(false, Ordering::SeqCst)
    }

    fn install(&self, canceller: Option<Box<dyn Canceller>>) {
        *self
            .inner
            .canceller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = canceller.map(Arc::from);
    }

    fn clear(&self) {
        self.install(None);
    }
}

/// Database-backed mutual exclusion lock for one cluster identifier.
pub struct RowLock {
    config: LockConfig,
    connector: Box<dyn Connector>,
    session: Option<LockSession>,
    interrupt: InterruptHandle,
}

impl RowLock {
    /// Builds the lock for the configured driver and bootstraps its table.
    pub fn new(config: LockConfig) -> Result<Self, LockError> {
        let connector: Box<dyn Connector> = match config.driver() {
            DriverKind::Postgres => Box::new(PostgresConnector::new(&config)?),
            DriverKind::Memory => {
                warn!(
                    endpoint = config.endpoint(),
                    cluster_id = config.cluster_id(),
                    "driverIdentity=memory only excludes locks inside this process"
                );
                Box::new(MemoryDatabase::named(config.endpoint()).connector(config.table_name()))
            }
        };
        Self::with_connector(config, connector)
    }

    /// Uses `connector` instead of the configured driver. The connector must
    /// target `config.table_name()`.
    pub fn with_connector(
        config: LockConfig,
        connector: Box<dyn Connector>,
    ) -> Result<Self, LockError> {
        bootstrap(&config, connector.as_ref())?;
        debug!(
            cluster_id = config.cluster_id(),
            table = config.table_name(),
            "lock table ready"
        );
        Ok(Self {
            config,
            connector,
            session: None,
            interrupt: InterruptHandle::default(),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn state(&self) -> LockState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(LockState::Unheld)
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Try to take the lock, waiting at most the configured contention timeout.
    ///
    /// Returns `Ok(false)` when another node holds the row or when the table
    /// does not hold exactly one row for the cluster.
    pub fn acquire(&mut self) -> Result<bool, LockError> {
        if self.state() == LockState::Held {
            self.interrupt.take_pending();
            return Ok(true);
        }
        if self.interrupt.take_pending() {
            return Err(self.interrupted());
        }

        let mut session = match self.session.take() {
            Some(session) if !session.connection.is_closed() => session,
            Some(stale) => {
                self.interrupt.clear();
                teardown(stale);
                self.open_session()?
            }
            None => self.open_session()?,
        };

        let outcome = self.try_lock(session.connection.as_mut());
        // An interrupt that raced the locking read still fails the call.
        let interrupted = self.interrupt.take_pending();
        match outcome {
            Ok(_) if interrupted => {
                self.session = Some(session);
                Err(self.interrupted())
            }
            Ok(true) => {
                info!(
                    cluster_id = self.config.cluster_id(),
                    table = self.config.table_name(),
                    "acquired row lock"
                );
                session.state = LockState::Held;
                self.session = Some(session);
                Ok(true)
            }
            Ok(false) => {
                session.state = LockState::Unknown;
                self.session = Some(session);
                Ok(false)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    cluster_id = self.config.cluster_id(),
                    "lock acquisition failed"
                );
                self.interrupt.clear();
                teardown(session);
                Err(LockError::Storage(err))
            }
        }
    }

    /// Re-validate ownership on the held connection without giving it up.
    ///
    /// Anything short of proof that the row is still locked by this session
    /// counts as lost; the session is then torn down.
    pub fn is_held(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.state != LockState::Held {
            return false;
        }

        match probe(self.config.cluster_id(), session.connection.as_mut()) {
            Ok(true) => true,
            Ok(false) => {
                warn!(cluster_id = self.config.cluster_id(), "lost the row lock");
                self.demote();
                false
            }
            Err(err) => {
                warn!(
                    error = %err,
                    cluster_id = self.config.cluster_id(),
                    "lost the row lock"
                );
                self.demote();
                false
            }
        }
    }

    /// Give the lock up and drop the connection. Never fails.
    pub fn release(&mut self) {
        self.interrupt.clear();
        let Some(session) = self.session.take() else {
            return;
        };
        let was_held = session.state == LockState::Held;
        teardown(session);
        if was_held {
            info!(cluster_id = self.config.cluster_id(), "released row lock");
        }
    }

    /// Drops any session and reports the interrupt as a storage error.
    fn interrupted(&mut self) -> LockError {
        warn!(cluster_id = self.config.cluster_id(), "lock acquisition interrupted");
        self.demote();
        LockError::Storage(DriverError::Cancelled)
    }

    fn demote(&mut self) {
        self.interrupt.clear();
        if let Some(session) = self.session.take() {
            teardown(session);
        }
    }

    fn open_session(&self) -> Result<LockSession, LockError> {
        let connection = self.connector.connect().map_err(LockError::Storage)?;
        self.interrupt.install(connection.canceller());
        Ok(LockSession {
            connection,
            state: LockState::Unknown,
        })
    }

    fn try_lock(&self, conn: &mut dyn LockConnection) -> Result<bool, DriverError> {
        let cluster_id = self.config.cluster_id();
        conn.begin()?;
        if self.interrupt.is_pending() {
            return Err(DriverError::Cancelled);
        }
        let wait = LockWait::from_timeout(self.config.contention_timeout());
        match conn.lock_rows(cluster_id, wait) {
            Ok(1) => {
                conn.touch(cluster_id, now_marker())?;
                Ok(true)
            }
            Ok(rows) => {
                warn!(
                    rows,
                    cluster_id, "expected exactly one lock row, refusing to acquire"
                );
                conn.rollback()?;
                Ok(false)
            }
            Err(DriverError::LockTimeout) => {
                debug!(cluster_id, "row lock held by another node");
                conn.rollback()?;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for RowLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn probe(cluster_id: &str, conn: &mut dyn LockConnection) -> Result<bool, DriverError> {
    if conn.is_closed() || !conn.holds_transaction()? {
        return Ok(false);
    }
    if conn.lock_rows(cluster_id, LockWait::NoWait)? != 1 {
        return Ok(false);
    }
    Ok(conn.touch(cluster_id, now_marker())? == 1)
}

/// Rollback and close, swallowing errors: the connection may already be gone.
fn teardown(session: LockSession) {
    let mut connection = session.connection;
    if let Err(err) = connection.rollback() {
        debug!(error = %err, "rollback failed while releasing lock connection");
    }
    if let Err(err) = connection.close() {
        debug!(error = %err, "close failed while releasing lock connection");
    }
}

/// Make sure the table exists and holds a row for the cluster, without ever
/// touching an existing row.
fn bootstrap(config: &LockConfig, connector: &dyn Connector) -> Result<(), LockError> {
    let mut conn = connector
        .connect()
        .map_err(LockError::StorageUnavailable)?;
    let seeded = seed(config, conn.as_mut());
    if seeded.is_err() {
        if let Err(err) = conn.rollback() {
            debug!(error = %err, "rollback failed after bootstrap error");
        }
    }
    if let Err(err) = conn.close() {
        debug!(error = %err, "close failed after bootstrap");
    }
    seeded.map_err(LockError::StorageUnavailable)
}

fn seed(config: &LockConfig, conn: &mut dyn LockConnection) -> Result<(), DriverError> {
    let cluster_id = config.cluster_id();
    conn.begin()?;
    conn.guard_schema()?;
    let markers = match conn.read_markers(cluster_id) {
        Ok(markers) => markers,
        Err(DriverError::UndefinedTable(table)) => {
            info!(table = %table, "creating lock table");
            conn.rollback()?;
            conn.begin()?;
            conn.guard_schema()?;
            conn.create_table()?;
            conn.read_markers(cluster_id)?
        }
        Err(err) => return Err(err),
    };

    match markers.len() {
        0 => {
            let marker = now_marker();
            conn.insert_row(cluster_id, marker)?;
            info!(
                cluster_id,
                table = config.table_name(),
                owner_marker = marker,
                "seeded lock row"
            );
        }
        1 => debug!(cluster_id, "lock row already present"),
        rows => warn!(
            rows,
            cluster_id, "duplicate lock rows, acquisition will fail until resolved"
        ),
    }
    conn.commit()
}
