//! In-process lock store.
//!
//! Models the parts of a relational database the lock relies on: tables of
//! `(owner_marker, cluster_id)` rows, per-session transactions with rollback,
//! row-exclusive locks with bounded waits, session termination and outages.
//! Databases are shared by name through [`MemoryDatabase::named`], so several
//! locks in one process can contend exactly like separate nodes would.
//!
//! Writes are visible to other sessions before commit; the lock never depends
//! on isolation between sessions, only on row-lock exclusivity.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use tracing::debug;

use crate::error::DriverError;
use crate::store::{Canceller, Connector, LockConnection, LockWait};

type SessionId = u64;

struct MemoryRow {
    id: u64,
    cluster_id: String,
    marker: i64,
    locked_by: Option<SessionId>,
}

enum Undo {
    CreateTable(String),
    Insert { table: String, row: u64 },
    Marker { table: String, row: u64, previous: i64 },
}

#[derive(Default)]
struct SessionState {
    in_tx: bool,
    wrote: bool,
    waiting: bool,
    cancelled: bool,
    killed: bool,
    undo: Vec<Undo>,
}

struct DbState {
    online: bool,
    tables: HashMap<String, Vec<MemoryRow>>,
    sessions: HashMap<SessionId, SessionState>,
    schema_guard: Option<SessionId>,
    next_session: SessionId,
    next_row: u64,
}

impl DbState {
    fn session(&mut self, id: SessionId) -> Result<&mut SessionState, DriverError> {
        if !self.online {
            return Err(DriverError::Closed);
        }
        match self.sessions.get_mut(&id) {
            Some(session) if !session.killed => Ok(session),
            _ => Err(DriverError::Closed),
        }
    }

    fn table(&mut self, name: &str) -> Result<&mut Vec<MemoryRow>, DriverError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DriverError::UndefinedTable(name.to_string()))
    }

    fn push_row(&mut self, table: &str, cluster_id: &str, marker: i64) -> Result<u64, DriverError> {
        let id = self.next_row;
        self.next_row += 1;
        self.table(table)?.push(MemoryRow {
            id,
            cluster_id: cluster_id.to_string(),
            marker,
            locked_by: None,
        });
        Ok(id)
    }

    /// Ends the session's transaction, undoing its writes unless committing.
    fn finish(&mut self, id: SessionId, commit: bool) {
        let undo = match self.sessions.get_mut(&id) {
            Some(session) => {
                session.in_tx = false;
                session.wrote = false;
                std::mem::take(&mut session.undo)
            }
            None => Vec::new(),
        };
        if !commit {
            for entry in undo.into_iter().rev() {
                match entry {
                    Undo::CreateTable(table) => {
                        self.tables.remove(&table);
                    }
                    Undo::Insert { table, row } => {
                        if let Some(rows) = self.tables.get_mut(&table) {
                            rows.retain(|r| r.id != row);
                        }
                    }
                    Undo::Marker {
                        table,
                        row,
                        previous,
                    } => {
                        if let Some(r) = self
                            .tables
                            .get_mut(&table)
                            .and_then(|rows| rows.iter_mut().find(|r| r.id == row))
                        {
                            r.marker = previous;
                        }
                    }
                }
            }
        }
        for rows in self.tables.values_mut() {
            for row in rows.iter_mut().filter(|r| r.locked_by == Some(id)) {
                row.locked_by = None;
            }
        }
        if self.schema_guard == Some(id) {
            self.schema_guard = None;
        }
    }

    fn kill(&mut self, id: SessionId) {
        self.finish(id, false);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.killed = true;
        }
    }
}

struct Shared {
    state: Mutex<DbState>,
    changed: Condvar,
}

/// A shared in-process database.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DbState {
                    online: true,
                    tables: HashMap::new(),
                    sessions: HashMap::new(),
                    schema_guard: None,
                    next_session: 1,
                    next_row: 1,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// The process-wide database registered under `name`, created on first use.
    pub fn named(name: &str) -> Self {
        static REGISTRY: OnceLock<Mutex<HashMap<String, MemoryDatabase>>> = OnceLock::new();
        let mut registry = REGISTRY
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.entry(name.to_string()).or_default().clone()
    }

    pub fn connector(&self, table: &str) -> MemoryConnector {
        MemoryConnector {
            db: self.clone(),
            table: table.to_string(),
        }
    }

    fn state(&self) -> MutexGuard<'_, DbState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate an outage. Going offline terminates every open session.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state();
        state.online = online;
        if !online {
            let ids: Vec<SessionId> = state.sessions.keys().copied().collect();
            for id in ids {
                state.kill(id);
            }
        }
        self.shared.changed.notify_all();
    }

    /// Terminate every session holding a row lock for `cluster_id`, rolling
    /// back its transaction. Returns the number of sessions terminated.
    pub fn terminate_holders(&self, table: &str, cluster_id: &str) -> usize {
        let mut state = self.state();
        let mut holders: Vec<SessionId> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.cluster_id == cluster_id)
                    .filter_map(|r| r.locked_by)
                    .collect()
            })
            .unwrap_or_default();
        holders.sort_unstable();
        holders.dedup();
        for id in &holders {
            debug!(session = id, table, cluster_id, "terminating lock holder");
            state.kill(*id);
        }
        self.shared.changed.notify_all();
        holders.len()
    }

    /// Markers stored for `cluster_id`, or `None` if the table does not exist.
    pub fn markers(&self, table: &str, cluster_id: &str) -> Option<Vec<i64>> {
        let state = self.state();
        state.tables.get(table).map(|rows| {
            rows.iter()
                .filter(|r| r.cluster_id == cluster_id)
                .map(|r| r.marker)
                .collect()
        })
    }

    /// Committed insert outside any session, creating the table if needed.
    pub fn insert_row(&self, table: &str, cluster_id: &str, marker: i64) {
        let mut state = self.state();
        state.tables.entry(table.to_string()).or_default();
        let _ = state.push_row(table, cluster_id, marker);
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.state().tables.contains_key(table)
    }

    /// Sessions that are open and not terminated.
    pub fn open_sessions(&self) -> usize {
        self.state()
            .sessions
            .values()
            .filter(|s| !s.killed)
            .count()
    }
}

pub struct MemoryConnector {
    db: MemoryDatabase,
    table: String,
}

impl Connector for MemoryConnector {
    fn connect(&self) -> Result<Box<dyn LockConnection>, DriverError> {
        let mut state = self.db.state();
        if !state.online {
            return Err(DriverError::Closed);
        }
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(id, SessionState::default());
        Ok(Box::new(MemoryConnection {
            db: self.db.clone(),
            id,
            table: self.table.clone(),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    db: MemoryDatabase,
    id: SessionId,
    table: String,
    closed: bool,
}

impl MemoryConnection {
    fn end(&mut self, commit: bool) -> Result<(), DriverError> {
        let mut state = self.db.state();
        state.session(self.id)?;
        state.finish(self.id, commit);
        self.db.shared.changed.notify_all();
        Ok(())
    }
}

impl LockConnection for MemoryConnection {
    fn begin(&mut self) -> Result<(), DriverError> {
        let mut state = self.db.state();
        let session = state.session(self.id)?;
        session.in_tx = true;
        session.wrote = false;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.end(true)
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.end(false)
    }

    fn close(mut self: Box<Self>) -> Result<(), DriverError> {
        self.closed = true;
        let mut state = self.db.state();
        state.finish(self.id, false);
        let was_alive = state
            .sessions
            .remove(&self.id)
            .is_some_and(|s| !s.killed);
        self.db.shared.changed.notify_all();
        if was_alive && state.online {
            Ok(())
        } else {
            Err(DriverError::Closed)
        }
    }

    fn is_closed(&self) -> bool {
        if self.closed {
            return true;
        }
        let mut state = self.db.state();
        let gone = state.session(self.id).is_err();
        gone
    }

    fn guard_schema(&mut self) -> Result<(), DriverError> {
        let mut state = self.db.state();
        loop {
            state.session(self.id)?;
            match state.schema_guard {
                None => {
                    state.schema_guard = Some(self.id);
                    return Ok(());
                }
                Some(owner) if owner == self.id => return Ok(()),
                Some(_) => {
                    state = self
                        .db
                        .shared
                        .changed
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    fn create_table(&mut self) -> Result<(), DriverError> {
        let mut state = self.db.state();
        let in_tx = state.session(self.id)?.in_tx;
        if state.tables.contains_key(&self.table) {
            return Ok(());
        }
        state.tables.insert(self.table.clone(), Vec::new());
        if in_tx {
            state
                .session(self.id)?
                .undo
                .push(Undo::CreateTable(self.table.clone()));
        }
        Ok(())
    }

    fn read_markers(&mut self, cluster_id: &str) -> Result<Vec<i64>, DriverError> {
        let mut state = self.db.state();
        state.session(self.id)?;
        let markers = state
            .table(&self.table)?
            .iter()
            .filter(|r| r.cluster_id == cluster_id)
            .map(|r| r.marker)
            .collect();
        Ok(markers)
    }

    fn insert_row(&mut self, cluster_id: &str, marker: i64) -> Result<(), DriverError> {
        let mut state = self.db.state();
        let in_tx = state.session(self.id)?.in_tx;
        let row = state.push_row(&self.table, cluster_id, marker)?;
        if in_tx {
            let session = state.session(self.id)?;
            session.wrote = true;
            session.undo.push(Undo::Insert {
                table: self.table.clone(),
                row,
            });
        }
        Ok(())
    }

    fn lock_rows(&mut self, cluster_id: &str, wait: LockWait) -> Result<usize, DriverError> {
        // `None` when the budget runs past what `Instant` can represent.
        let deadline = match wait {
            LockWait::NoWait => Some(Instant::now()),
            LockWait::Bounded(budget) => Instant::now().checked_add(budget),
        };
        let mut state = self.db.state();
        loop {
            let session = state.session(self.id)?;
            if session.cancelled {
                session.cancelled = false;
                session.waiting = false;
                return Err(DriverError::Cancelled);
            }
            let in_tx = session.in_tx;
            let id = self.id;
            let rows = state.table(&self.table)?;
            let contended = rows
                .iter()
                .any(|r| r.cluster_id == cluster_id && r.locked_by.is_some_and(|o| o != id));
            if !contended {
                let mut count = 0;
                for row in rows.iter_mut().filter(|r| r.cluster_id == cluster_id) {
                    if in_tx {
                        row.locked_by = Some(id);
                    }
                    count += 1;
                }
                state.session(self.id)?.waiting = false;
                return Ok(count);
            }

            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if deadline > now => Some(deadline - now),
                Some(_) => {
                    state.session(self.id)?.waiting = false;
                    return Err(DriverError::LockTimeout);
                }
                None => None,
            };
            state.session(self.id)?.waiting = true;
            let changed = &self.db.shared.changed;
            state = match remaining {
                Some(remaining) => {
                    changed
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
                None => changed
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    fn touch(&mut self, cluster_id: &str, marker: i64) -> Result<u64, DriverError> {
        let mut state = self.db.state();
        let in_tx = state.session(self.id)?.in_tx;
        let mut undo = Vec::new();
        for row in state
            .table(&self.table)?
            .iter_mut()
            .filter(|r| r.cluster_id == cluster_id)
        {
            undo.push(Undo::Marker {
                table: self.table.clone(),
                row: row.id,
                previous: row.marker,
            });
            row.marker = marker;
        }
        let updated = undo.len() as u64;
        if in_tx {
            let session = state.session(self.id)?;
            session.wrote = true;
            session.undo.extend(undo);
        }
        Ok(updated)
    }

    fn holds_transaction(&mut self) -> Result<bool, DriverError> {
        let mut state = self.db.state();
        let session = state.session(self.id)?;
        Ok(session.in_tx && session.wrote)
    }

    fn canceller(&self) -> Option<Box<dyn Canceller>> {
        Some(Box::new(MemoryCanceller {
            db: self.db.clone(),
            id: self.id,
        }))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // A dropped session behaves like a broken network connection.
        let mut state = self.db.state();
        state.finish(self.id, false);
        state.sessions.remove(&self.id);
        self.db.shared.changed.notify_all();
    }
}

struct MemoryCanceller {
    db: MemoryDatabase,
    id: SessionId,
}

impl Canceller for MemoryCanceller {
    fn cancel(&self) -> Result<(), DriverError> {
        let mut state = self.db.state();
        if let Some(session) = state.sessions.get_mut(&self.id) {
            if session.waiting {
                session.cancelled = true;
            }
        }
        self.db.shared.changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const TABLE: &str = "node_lock";

    fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.insert_row(TABLE, "c1", 10);
        db
    }

    #[test]
    fn missing_table_is_reported() -> anyhow::Result<()> {
        let db = MemoryDatabase::new();
        let mut conn = db.connector(TABLE).connect()?;
        assert!(matches!(
            conn.read_markers("c1"),
            Err(DriverError::UndefinedTable(t)) if t == TABLE
        ));
        conn.create_table()?;
        assert!(conn.read_markers("c1")?.is_empty());
        Ok(())
    }

    #[test]
    fn rollback_undoes_writes_and_frees_rows() -> anyhow::Result<()> {
        let db = seeded();
        let connector = db.connector(TABLE);
        let mut holder = connector.connect()?;
        holder.begin()?;
        assert_eq!(holder.lock_rows("c1", LockWait::NoWait)?, 1);
        assert_eq!(holder.touch("c1", 99)?, 1);
        assert!(holder.holds_transaction()?);
        assert_eq!(db.markers(TABLE, "c1"), Some(vec![99]));

        let mut other = connector.connect()?;
        other.begin()?;
        assert!(matches!(
            other.lock_rows("c1", LockWait::NoWait),
            Err(DriverError::LockTimeout)
        ));
        other.rollback()?;

        holder.rollback()?;
        assert_eq!(db.markers(TABLE, "c1"), Some(vec![10]));
        assert!(!holder.holds_transaction()?);

        other.begin()?;
        assert_eq!(other.lock_rows("c1", LockWait::NoWait)?, 1);
        Ok(())
    }

    #[test]
    fn bounded_wait_times_out() -> anyhow::Result<()> {
        let db = seeded();
        let connector = db.connector(TABLE);
        let mut holder = connector.connect()?;
        holder.begin()?;
        holder.lock_rows("c1", LockWait::NoWait)?;

        let mut waiter = connector.connect()?;
        waiter.begin()?;
        let started = Instant::now();
        let result = waiter.lock_rows("c1", LockWait::Bounded(Duration::from_millis(100)));
        assert!(matches!(result, Err(DriverError::LockTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        Ok(())
    }

    #[test]
    fn oversized_wait_budget_waits_without_deadline() -> anyhow::Result<()> {
        let db = seeded();
        let connector = db.connector(TABLE);
        let mut free = connector.connect()?;
        free.begin()?;
        assert_eq!(free.lock_rows("c1", LockWait::Bounded(Duration::MAX))?, 1);

        let waiter = thread::spawn(move || -> Result<usize, DriverError> {
            let mut conn = connector.connect()?;
            conn.begin()?;
            conn.lock_rows("c1", LockWait::Bounded(Duration::MAX))
        });
        thread::sleep(Duration::from_millis(50));
        free.rollback()?;
        assert_eq!(waiter.join().expect("waiter thread")?, 1);
        Ok(())
    }

    #[test]
    fn waiter_is_granted_when_holder_commits() -> anyhow::Result<()> {
        let db = seeded();
        let connector = db.connector(TABLE);
        let mut holder = connector.connect()?;
        holder.begin()?;
        holder.lock_rows("c1", LockWait::NoWait)?;

        let waiter = thread::spawn(move || -> Result<usize, DriverError> {
            let mut conn = connector.connect()?;
            conn.begin()?;
            conn.lock_rows("c1", LockWait::Bounded(Duration::from_secs(5)))
        });
        thread::sleep(Duration::from_millis(50));
        holder.commit()?;
        assert_eq!(waiter.join().expect("waiter thread")?, 1);
        Ok(())
    }

    #[test]
    fn cancel_interrupts_a_waiting_lock() -> anyhow::Result<()> {
        let db = seeded();
        let connector = db.connector(TABLE);
        let mut holder = connector.connect()?;
        holder.begin()?;
        holder.lock_rows("c1", LockWait::NoWait)?;

        let mut waiter = connector.connect()?;
        let canceller = waiter.canceller().expect("memory connections can be cancelled");
        let handle = thread::spawn(move || {
            waiter.begin()?;
            waiter.lock_rows("c1", LockWait::Bounded(Duration::from_secs(10)))
        });
        // Cancelling an idle session is a no-op, so retry until the wait starts.
        while !handle.is_finished() {
            canceller.cancel()?;
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(
            handle.join().expect("waiter thread"),
            Err(DriverError::Cancelled)
        ));
        Ok(())
    }

    #[test]
    fn terminated_session_loses_locks_and_fails_afterwards() -> anyhow::Result<()> {
        let db = seeded();
        let mut holder = db.connector(TABLE).connect()?;
        holder.begin()?;
        holder.lock_rows("c1", LockWait::NoWait)?;
        holder.touch("c1", 50)?;

        assert_eq!(db.terminate_holders(TABLE, "c1"), 1);
        assert_eq!(db.markers(TABLE, "c1"), Some(vec![10]));
        assert!(holder.is_closed());
        assert!(matches!(
            holder.lock_rows("c1", LockWait::NoWait),
            Err(DriverError::Closed)
        ));
        assert!(holder.close().is_err());
        Ok(())
    }

    #[test]
    fn outage_refuses_connections() -> anyhow::Result<()> {
        let db = seeded();
        let connector = db.connector(TABLE);
        let conn = connector.connect()?;
        db.set_online(false);
        assert!(conn.is_closed());
        assert!(matches!(connector.connect(), Err(DriverError::Closed)));
        db.set_online(true);
        assert!(connector.connect().is_ok());
        Ok(())
    }

    #[test]
    fn named_databases_are_shared() {
        let a = MemoryDatabase::named("memory-test-shared");
        a.insert_row(TABLE, "c9", 1);
        let b = MemoryDatabase::named("memory-test-shared");
        assert_eq!(b.markers(TABLE, "c9"), Some(vec![1]));
        assert!(!MemoryDatabase::named("memory-test-other").table_exists(TABLE));
    }
}
