//! Sessions: units of work bound to one engine.
//!
//! A [`Session`] owns at most one pooled connection, checked out on
//! [`Session::begin`] and returned on commit, rollback or close. It also keeps
//! an identity map of the records added to or loaded through it. The map
//! follows two fixed rules:
//!
//! - nothing is flushed implicitly; queries run through
//!   [`Session::connection`] never see pending records until
//!   [`Session::flush`] is called;
//! - committing leaves tracked records untouched, while rolling back drops
//!   them, since their stored state no longer exists.
//!
//! Records leave a session through [`Session::expunge`], which hands back an
//! owned snapshot that no longer depends on the session or its connection.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::Connection;

use crate::engine::{Engine, PooledConn};
use crate::error::{DbError, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A record type that sessions can insert and load.
pub trait Persist: Send + 'static {
    /// Table the record lives in. Used to key the identity map.
    const TABLE: &'static str;

    /// Storage-assigned key, `None` until the record has been inserted.
    fn primary_key(&self) -> Option<i64>;

    /// Inserts the record and copies storage-generated values (key,
    /// timestamps) back into `self`.
    fn insert(&mut self, conn: &Connection) -> rusqlite::Result<()>;

    /// Loads the record stored under `key`.
    fn load(conn: &Connection, key: i64) -> rusqlite::Result<Option<Self>>
    where
        Self: Sized;
}

/// Object-safe view of a [`Persist`] record held in the identity map.
trait Managed: Send {
    fn table(&self) -> &'static str;
    fn primary_key(&self) -> Option<i64>;
    fn insert(&mut self, conn: &Connection) -> rusqlite::Result<()>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Persist> Managed for T {
    fn table(&self) -> &'static str {
        T::TABLE
    }

    fn primary_key(&self) -> Option<i64> {
        Persist::primary_key(self)
    }

    fn insert(&mut self, conn: &Connection) -> rusqlite::Result<()> {
        Persist::insert(self, conn)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Added but not yet written.
    Pending,
    /// Written (or loaded) within this session.
    Persistent,
}

struct Entry {
    state: EntryState,
    record: Box<dyn Managed>,
}

/// Typed handle to a record tracked by a [`Session`].
pub struct Tracked<T> {
    session: u64,
    slot: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Tracked<T> {}

impl<T> PartialEq for Tracked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.session == other.session && self.slot == other.slot
    }
}

impl<T> Eq for Tracked<T> {}

impl<T> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("session", &self.session)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Produces sessions bound to one engine.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    engine: Arc<Engine>,
}

impl SessionFactory {
    /// Binds a factory to `engine`.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// The engine sessions are bound to.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Returns a fresh, independent session.
    pub fn new_session(&self) -> Session {
        Session::new(Arc::clone(&self.engine))
    }
}

/// A unit of work bound to one engine.
pub struct Session {
    id: u64,
    engine: Arc<Engine>,
    conn: Option<PooledConn>,
    in_transaction: bool,
    entries: BTreeMap<u64, Entry>,
    by_key: HashMap<(&'static str, i64), u64>,
    next_slot: u64,
}

impl Session {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            conn: None,
            in_transaction: false,
            entries: BTreeMap::new(),
            by_key: HashMap::new(),
            next_slot: 0,
        }
    }

    /// The engine this session draws connections from.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Whether a transaction is open.
    pub fn is_active(&self) -> bool {
        self.in_transaction
    }

    /// Whether a pooled connection is currently checked out.
    pub fn holds_connection(&self) -> bool {
        self.conn.is_some()
    }

    /// Number of records in the identity map, pending or persistent.
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of records added but not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state == EntryState::Pending)
            .count()
    }

    /// Checks out a connection (if needed) and opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] if a transaction is already open;
    /// nested scopes need their own session. Checkout errors are passed
    /// through.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(DbError::Transaction(
                "a transaction is already active on this session",
            ));
        }

        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.engine.checkout()?,
        };
        if let Err(e) = conn.execute_batch("BEGIN DEFERRED") {
            // conn goes back to the pool here
            return Err(e.into());
        }

        self.conn = Some(conn);
        self.in_transaction = true;
        tracing::debug!(session = self.id, "transaction begun");
        Ok(())
    }

    /// Flushes pending records and commits, then returns the connection to
    /// the pool. Tracked records keep their values.
    ///
    /// If the flush fails the transaction stays open. If `COMMIT` itself
    /// fails the transaction is rolled back before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] without an open transaction, or the
    /// flush/commit failure.
    pub fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(DbError::Transaction("no active transaction to commit"));
        }
        self.flush()?;

        let committed = self.active_connection()?.execute_batch("COMMIT");
        match committed {
            Ok(()) => {
                self.in_transaction = false;
                self.release();
                tracing::debug!(session = self.id, "transaction committed");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = self.id, error = %e, "commit failed, rolling back");
                if let Err(rollback_err) = self.rollback() {
                    tracing::error!(
                        session = self.id,
                        error = %rollback_err,
                        "rollback after failed commit also failed"
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Rolls back, drops every tracked record and returns the connection to
    /// the pool.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] without an open transaction, or the
    /// backend failure. The session is closed out either way.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(DbError::Transaction("no active transaction to roll back"));
        }

        let outcome = match &self.conn {
            Some(conn) => conn.execute_batch("ROLLBACK"),
            None => Ok(()),
        };

        self.in_transaction = false;
        self.entries.clear();
        self.by_key.clear();

        if let (Err(e), Some(conn)) = (&outcome, &self.conn) {
            tracing::error!(session = self.id, error = %e, "rollback failed");
            if !conn.is_autocommit() {
                // One more attempt so the pool never gets a connection back
                // with a transaction still open.
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
        self.release();
        tracing::debug!(session = self.id, "transaction rolled back");

        outcome.map_err(DbError::from)
    }

    /// Ends the session: rolls back an open transaction, forgets every
    /// tracked record and returns the connection.
    pub fn close(&mut self) {
        if self.in_transaction {
            if let Err(e) = self.rollback() {
                tracing::warn!(session = self.id, error = %e, "rollback on close failed");
            }
        }
        self.entries.clear();
        self.by_key.clear();
        self.release();
    }

    /// Starts tracking a new record. It is written on the next flush.
    pub fn add<T: Persist>(&mut self, record: T) -> Tracked<T> {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.entries.insert(
            slot,
            Entry {
                state: EntryState::Pending,
                record: Box::new(record),
            },
        );
        self.handle(slot)
    }

    /// Writes every pending record, in the order they were added.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] when records are pending but no
    /// transaction is open, or the insert failure (unique violations are
    /// reported as [`DbError::UniqueViolation`]).
    pub fn flush(&mut self) -> Result<()> {
        if self.pending_count() == 0 {
            return Ok(());
        }
        if !self.in_transaction {
            return Err(DbError::Transaction("flush requires an active transaction"));
        }
        let conn = self
            .conn
            .as_ref()
            .ok_or(DbError::Transaction("transaction has no connection"))?;

        for (slot, entry) in self.entries.iter_mut() {
            if entry.state != EntryState::Pending {
                continue;
            }
            entry.record.insert(conn)?;
            entry.state = EntryState::Persistent;
            if let Some(key) = entry.record.primary_key() {
                self.by_key.insert((entry.record.table(), key), *slot);
            }
        }

        tracing::debug!(session = self.id, tracked = self.entries.len(), "session flushed");
        Ok(())
    }

    /// Current values of a tracked record.
    pub fn get<T: Persist>(&self, handle: &Tracked<T>) -> Option<&T> {
        if handle.session != self.id {
            return None;
        }
        self.entries
            .get(&handle.slot)
            .and_then(|entry| entry.record.as_any().downcast_ref::<T>())
    }

    /// Loads the record stored under `key`, reusing the identity map entry
    /// when the record is already tracked.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] without an open transaction, or the
    /// query failure.
    pub fn find<T: Persist>(&mut self, key: i64) -> Result<Option<Tracked<T>>> {
        if let Some(slot) = self.by_key.get(&(T::TABLE, key)).copied() {
            return Ok(Some(self.handle(slot)));
        }

        let Some(record) = T::load(self.active_connection()?, key)? else {
            return Ok(None);
        };

        let slot = self.next_slot;
        self.next_slot += 1;
        self.entries.insert(
            slot,
            Entry {
                state: EntryState::Persistent,
                record: Box::new(record),
            },
        );
        self.by_key.insert((T::TABLE, key), slot);
        Ok(Some(self.handle(slot)))
    }

    /// Detaches a record and returns an owned snapshot of its values.
    ///
    /// A pending record that is expunged is never written.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] if the handle belongs to another
    /// session or was already detached.
    pub fn expunge<T: Persist>(&mut self, handle: Tracked<T>) -> Result<T> {
        if handle.session != self.id {
            return Err(DbError::Transaction(
                "record handle belongs to a different session",
            ));
        }
        if self.get(&handle).is_none() {
            return Err(DbError::Transaction(
                "record is not attached to this session",
            ));
        }

        let entry = self
            .entries
            .remove(&handle.slot)
            .ok_or(DbError::Transaction("record is not attached to this session"))?;
        if let Some(key) = entry.record.primary_key() {
            self.by_key.remove(&(entry.record.table(), key));
        }

        entry
            .record
            .into_any()
            .downcast::<T>()
            .map(|record| *record)
            .map_err(|_| DbError::Transaction("record handle has the wrong type"))
    }

    /// The connection of the open transaction, for hand-written queries.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] without an open transaction.
    pub fn connection(&self) -> Result<&Connection> {
        self.active_connection()
    }

    fn active_connection(&self) -> Result<&Connection> {
        match (&self.conn, self.in_transaction) {
            (Some(conn), true) => Ok(conn),
            _ => Err(DbError::Transaction("no active transaction")),
        }
    }

    fn handle<T>(&self, slot: u64) -> Tracked<T> {
        Tracked {
            session: self.id,
            slot,
            _record: PhantomData,
        }
    }

    fn release(&mut self) {
        if self.conn.take().is_some() {
            tracing::trace!(session = self.id, "connection returned to pool");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.in_transaction {
            tracing::warn!(
                session = self.id,
                "session dropped with an open transaction, rolling back"
            );
        }
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("in_transaction", &self.in_transaction)
            .field("holds_connection", &self.conn.is_some())
            .field("tracked", &self.entries.len())
            .finish()
    }
}
