//! Embedded SQL migration runner.
//!
//! Migrations are SQL files embedded at compile time. They run sequentially
//! on startup, tracked by the `_usermgr_migrations` table. Each migration
//! runs exactly once, inside its own transaction.

use rusqlite::Connection;

use crate::error::{DbError, Result};

/// A single embedded migration.
struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. New migrations are appended here.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_users",
        sql: include_str!("migrations/001_users.sql"),
    },
];

/// Runs all pending migrations against the given connection.
///
/// Returns the number of migrations applied by this call.
///
/// # Errors
///
/// Returns [`DbError::Migration`] if any migration fails to execute or if
/// the tracking table cannot be queried.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    run_migrations_from_list(conn, MIGRATIONS)
}

fn run_migrations_from_list(conn: &Connection, migrations: &[Migration]) -> Result<usize> {
    let failed = |name: &str| {
        let name = name.to_string();
        move |source| DbError::Migration { name, source }
    };

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _usermgr_migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(failed("_usermgr_migrations_bootstrap"))?;

    let mut applied = 0;

    for migration in migrations {
        let already_applied: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _usermgr_migrations WHERE name = ?1",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(failed(migration.name))?;

        if already_applied {
            tracing::debug!(
                migration = migration.name,
                "migration already applied, skipping"
            );
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");

        let tx = conn
            .unchecked_transaction()
            .map_err(failed(migration.name))?;
        tx.execute_batch(migration.sql)
            .map_err(failed(migration.name))?;
        tx.execute(
            "INSERT INTO _usermgr_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(failed(migration.name))?;
        tx.commit().map_err(failed(migration.name))?;

        applied += 1;
    }

    Ok(applied)
}
