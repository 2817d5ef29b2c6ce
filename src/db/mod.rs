//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - PostgreSQL handles over a pool or a single dedicated connection
//! - SQLite handles over a file pool
//! - Context-scoped query facades and transaction management
//! - Transaction-scoped and session-scoped advisory locks
//! - Administrative helpers (create/drop/migrate databases)

pub mod admin;
pub mod locker;
pub(crate) mod macros;
pub(crate) mod params;
pub(crate) mod pool;
pub mod postgres;
pub(crate) mod resolver;
pub mod sqlite;
pub(crate) mod transaction;
pub mod url;

pub use locker::PgLocker;
pub use postgres::{PgConn, PgDb, PgQuery, PgSource};
pub use sqlite::{SqliteDb, SqliteQuery};

use crate::error::{DbError, DbResult};

/// Reduce a fetched batch to its only row.
pub(crate) fn exactly_one<T>(mut rows: Vec<T>) -> DbResult<T> {
    match rows.len() {
        0 => Err(DbError::NoRows),
        1 => rows.pop().ok_or(DbError::NoRows),
        n => Err(DbError::invalid_input(format!(
            "expected exactly one row, query returned {} or more",
            n
        ))),
    }
}
