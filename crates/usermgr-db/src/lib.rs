//! Transactional data-access layer for the user-management service.
//!
//! Turns credentials into a connection identifier, provisions a pooled
//! engine under a fixed isolation contract, and runs units of work inside
//! transaction scopes that always end in exactly one commit or rollback.
//!
//! # Design decisions
//!
//! - **SQLite through `r2d2`**: the pool is bounded by `pool_size`,
//!   connections are replaced after `pool_recycle`, and every connection is
//!   checked on checkout. Other dialects parse but are refused at
//!   provisioning.
//! - **Snapshot reads**: [`IsolationMode::RepeatableRead`] puts every
//!   connection in WAL mode, so a transaction's reads see one consistent
//!   snapshot while other sessions commit.
//! - **Two execution models, one pool**: blocking callers wait on the pool
//!   itself; async callers wait on a semaphore sized to the pool and then run
//!   on `tokio`'s blocking threads.
//! - **Bodies cannot end their scope**: a transaction body works through a
//!   [`Unit`], which has no begin, commit or rollback. The scope performs
//!   the one terminal action.
//! - **Detached results**: records leave a scope as owned values, so nothing
//!   returned to a caller can touch a connection after the scope ends.

mod config;
mod dsn;
mod engine;
mod error;
mod migrations;
mod scope;
mod session;

pub use config::{
    ConnectionSpec, ExecutionModel, IsolationMode, PoolSettings, DEFAULT_CHARSET,
    DEFAULT_DIALECT_DRIVER, DEFAULT_POOL_RECYCLE, DEFAULT_POOL_SIZE,
};
pub use dsn::{build_connection_identifier, build_identifier, ConnectionIdentifier, IdentifierParts};
pub use engine::{provision, provision_with, DbPool, Engine, PooledConn};
pub use error::{DbError, Result};
pub use migrations::run_migrations;
pub use scope::{with_transaction, Detach, Snapshot, TransactionScope, Unit};
pub use session::{Persist, Session, SessionFactory, Tracked};
