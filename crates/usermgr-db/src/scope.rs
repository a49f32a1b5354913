//! Transaction scopes.
//!
//! A scope wraps a unit of work so that it ends in exactly one terminal
//! action: commit when the body succeeds, roll back when it fails, panics or
//! is abandoned. Records the body wants to return are detached from the
//! session before the commit, so callers only ever see owned values.
//!
//! Bodies work through a [`Unit`], which exposes the session's record and
//! query operations but none of its terminal ones. Only the scope commits
//! or rolls back.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::Connection;

use crate::engine::Engine;
use crate::error::{DbError, Result};
use crate::session::{Persist, Session, SessionFactory, Tracked};

/// The view of a session a transaction body works through.
///
/// Records can be added, flushed, found and detached, and hand-written
/// queries run on the transaction's connection. Begin, commit, rollback and
/// close stay with the enclosing [`TransactionScope`].
pub struct Unit<'s> {
    session: &'s mut Session,
}

impl Unit<'_> {
    /// The engine the session draws connections from.
    pub fn engine(&self) -> &Arc<Engine> {
        self.session.engine()
    }

    /// Number of records in the identity map.
    pub fn tracked_count(&self) -> usize {
        self.session.tracked_count()
    }

    /// Number of records added but not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.session.pending_count()
    }

    /// See [`Session::add`].
    pub fn add<T: Persist>(&mut self, record: T) -> Tracked<T> {
        self.session.add(record)
    }

    /// See [`Session::flush`].
    ///
    /// # Errors
    ///
    /// Returns the insert failure.
    pub fn flush(&mut self) -> Result<()> {
        self.session.flush()
    }

    /// See [`Session::get`].
    pub fn get<T: Persist>(&self, handle: &Tracked<T>) -> Option<&T> {
        self.session.get(handle)
    }

    /// See [`Session::find`].
    ///
    /// # Errors
    ///
    /// Returns the query failure.
    pub fn find<T: Persist>(&mut self, key: i64) -> Result<Option<Tracked<T>>> {
        self.session.find(key)
    }

    /// See [`Session::expunge`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] if the record is not attached.
    pub fn expunge<T: Persist>(&mut self, handle: Tracked<T>) -> Result<T> {
        self.session.expunge(handle)
    }

    /// The transaction's connection, for hand-written queries. Statements
    /// that end the transaction (`COMMIT`, `ROLLBACK`, `END`) do not belong
    /// here.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] if the transaction is gone.
    pub fn connection(&self) -> Result<&Connection> {
        self.session.connection()
    }
}

impl std::fmt::Debug for Unit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Unit").field(&*self.session).finish()
    }
}

/// Values a transaction body can hand back to its caller.
///
/// Tracked records are expunged from the session and returned by value;
/// plain values pass through unchanged.
pub trait Detach {
    /// What the caller receives once the scope has committed.
    type Output;

    /// Detaches `self` from the unit's session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] if a record is no longer attached.
    fn detach(self, unit: &mut Unit<'_>) -> Result<Self::Output>;
}

impl<T: Persist> Detach for Tracked<T> {
    type Output = T;

    fn detach(self, unit: &mut Unit<'_>) -> Result<T> {
        unit.expunge(self)
    }
}

impl<T: Persist> Detach for Option<Tracked<T>> {
    type Output = Option<T>;

    fn detach(self, unit: &mut Unit<'_>) -> Result<Option<T>> {
        self.map(|handle| unit.expunge(handle)).transpose()
    }
}

impl<T: Persist> Detach for Vec<Tracked<T>> {
    type Output = Vec<T>;

    fn detach(self, unit: &mut Unit<'_>) -> Result<Vec<T>> {
        self.into_iter()
            .map(|handle| unit.expunge(handle))
            .collect()
    }
}

impl<A: Detach, B: Detach> Detach for (A, B) {
    type Output = (A::Output, B::Output);

    fn detach(self, unit: &mut Unit<'_>) -> Result<Self::Output> {
        Ok((self.0.detach(unit)?, self.1.detach(unit)?))
    }
}

/// Wraps an already-owned value so it can be returned from a body as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<T>(pub T);

impl<T> Detach for Snapshot<T> {
    type Output = T;

    fn detach(self, _unit: &mut Unit<'_>) -> Result<T> {
        Ok(self.0)
    }
}

macro_rules! detach_by_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Detach for $ty {
                type Output = $ty;

                fn detach(self, _unit: &mut Unit<'_>) -> Result<$ty> {
                    Ok(self)
                }
            }
        )*
    };
}

detach_by_value!((), bool, i64, u64, usize, String);

/// RAII guard over an open transaction.
///
/// Call [`TransactionScope::commit`] or [`TransactionScope::rollback`] to end
/// it; dropping the guard without either (early return, `?`, panic) rolls
/// the transaction back. The guard derefs to the [`Unit`] it wraps, so the
/// session cannot be ended behind its back.
pub struct TransactionScope<'s> {
    unit: Unit<'s>,
    finished: bool,
}

impl<'s> TransactionScope<'s> {
    /// Opens a transaction on `session`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transaction`] if `session` already has one open,
    /// or the checkout failure.
    pub fn begin(session: &'s mut Session) -> Result<Self> {
        session.begin()?;
        Ok(Self {
            unit: Unit { session },
            finished: false,
        })
    }

    /// Flushes and commits.
    ///
    /// # Errors
    ///
    /// Returns the flush or commit failure; the transaction is rolled back
    /// in that case.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let result = self.unit.session.commit();
        if result.is_err() && self.unit.session.is_active() {
            // flush failed, commit never ran
            self.discard();
        }
        result
    }

    /// Rolls back.
    ///
    /// # Errors
    ///
    /// Returns the backend failure; the scope is closed out either way.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.unit.session.rollback()
    }

    fn abort(mut self) {
        self.finished = true;
        self.discard();
    }

    fn discard(&mut self) {
        if !self.unit.session.is_active() {
            return;
        }
        if let Err(e) = self.unit.session.rollback() {
            tracing::error!(error = %e, "transaction rollback failed");
        }
    }
}

impl<'s> Deref for TransactionScope<'s> {
    type Target = Unit<'s>;

    fn deref(&self) -> &Unit<'s> {
        &self.unit
    }
}

impl<'s> DerefMut for TransactionScope<'s> {
    fn deref_mut(&mut self) -> &mut Unit<'s> {
        &mut self.unit
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.unit.session.is_active() {
            if std::thread::panicking() {
                tracing::warn!("transaction body panicked, rolling back");
            } else {
                tracing::debug!("transaction scope dropped without commit, rolling back");
            }
        }
        self.discard();
    }
}

/// Runs `body` inside a new transaction on `session`.
///
/// On success pending records are flushed, the body's value is detached and
/// the transaction commits. On failure the transaction is rolled back and
/// the body's error is returned unchanged. A panic in `body` rolls back
/// while unwinding. The body only gets a [`Unit`], so it cannot commit or
/// roll back on its own:
///
/// ```compile_fail
/// use usermgr_db::{DbError, SessionFactory};
///
/// fn commits_early(factory: &SessionFactory) {
///     let _ = factory.transaction(|unit| {
///         unit.commit()?;
///         Ok::<_, DbError>(())
///     });
/// }
/// ```
///
/// # Errors
///
/// Returns the body's error, or a [`DbError`] (converted into `E`) from
/// begin, flush, detach or commit.
pub fn with_transaction<R, E, F>(session: &mut Session, body: F) -> std::result::Result<R::Output, E>
where
    F: FnOnce(&mut Unit<'_>) -> std::result::Result<R, E>,
    R: Detach,
    E: From<DbError>,
{
    run_scope(session, body, || false)
}

fn run_scope<R, E, F, C>(
    session: &mut Session,
    body: F,
    cancelled: C,
) -> std::result::Result<R::Output, E>
where
    F: FnOnce(&mut Unit<'_>) -> std::result::Result<R, E>,
    R: Detach,
    E: From<DbError>,
    C: Fn() -> bool,
{
    let mut scope = TransactionScope::begin(session)?;

    let value = match body(&mut *scope) {
        Ok(value) => value,
        Err(err) => {
            scope.abort();
            return Err(err);
        }
    };

    if let Err(e) = scope.flush() {
        scope.abort();
        return Err(e.into());
    }

    let output = match value.detach(&mut *scope) {
        Ok(output) => output,
        Err(e) => {
            scope.abort();
            return Err(e.into());
        }
    };

    if cancelled() {
        tracing::debug!("caller went away before commit, rolling back");
        scope.abort();
        return Err(DbError::Cancelled.into());
    }

    scope.commit()?;
    Ok(output)
}

/// Flags cancellation when the awaiting future is dropped.
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::Release);
        }
    }
}

impl SessionFactory {
    /// Runs `body` in a transaction on a fresh session, blocking the current
    /// thread.
    ///
    /// # Errors
    ///
    /// See [`with_transaction`].
    pub fn transaction<R, E, F>(&self, body: F) -> std::result::Result<R::Output, E>
    where
        F: FnOnce(&mut Unit<'_>) -> std::result::Result<R, E>,
        R: Detach,
        E: From<DbError>,
    {
        let mut session = self.new_session();
        with_transaction(&mut session, body)
    }

    /// Runs `body` in a transaction without blocking the async runtime.
    ///
    /// The caller suspends while every connection is busy (up to the acquire
    /// timeout), then the body runs on the blocking pool. Dropping the
    /// returned future before it completes cancels the operation: if the
    /// body has not committed yet it is rolled back, and its connection is
    /// returned to the pool once the body returns.
    ///
    /// # Errors
    ///
    /// See [`with_transaction`]. Also [`DbError::PoolExhausted`] when no
    /// connection frees up in time.
    pub async fn transaction_async<R, E, F>(&self, body: F) -> std::result::Result<R::Output, E>
    where
        F: FnOnce(&mut Unit<'_>) -> std::result::Result<R, E> + Send + 'static,
        R: Detach,
        R::Output: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = CancelOnDrop {
            flag: Arc::clone(&flag),
            armed: true,
        };

        let result = self
            .engine()
            .run_blocking(move |engine| {
                if flag.load(Ordering::Acquire) {
                    return Err(E::from(DbError::Cancelled));
                }
                let mut session = Session::new(Arc::clone(engine));
                run_scope(&mut session, body, || flag.load(Ordering::Acquire))
            })
            .await;

        guard.disarm();
        result
    }
}
