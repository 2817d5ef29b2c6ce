//! Session-scoped advisory locks.
//!
//! Unlike [`PgDb::with_lock`](crate::db::PgDb::with_lock), the lock taken
//! here belongs to a dedicated connection rather than a transaction, so the
//! callback may run for a long time and open transactions of its own. Closing
//! the connection releases the lock even if the explicit unlock fails.

use crate::context::Context;
use crate::db::postgres::PgConn;
use crate::db::url;
use crate::error::DbError;
use crate::models::QueryParam;
use std::future::Future;
use tracing::{debug, warn};

const TRY_LOCK: &str = "SELECT pg_try_advisory_lock($1)";
const UNLOCK: &str = "SELECT pg_advisory_unlock($1)";

/// Non-blocking session lock on one PostgreSQL database.
#[derive(Clone)]
pub struct PgLocker {
    database_url: String,
}

impl PgLocker {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Run `f` while holding session lock `key`.
    ///
    /// Returns `Ok(None)` without calling `f` when another session holds the
    /// lock, `Ok(Some(_))` with `f`'s value otherwise.
    pub async fn try_lock<T, E, F, Fut>(
        &self,
        ctx: &Context,
        key: i64,
        f: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let conn = PgConn::connect(ctx, &self.database_url).await?;
        // The lock must land on this connection even when ctx is in a transaction.
        let lock_ctx = ctx.unbound();

        let locked = conn
            .query(&lock_ctx)
            .scalar::<bool>(TRY_LOCK, &[QueryParam::Int(key)])
            .await;
        let locked = match locked {
            Ok(locked) => locked,
            Err(e) => {
                close_quietly(&conn).await;
                return Err(e.into());
            }
        };

        if !locked {
            debug!(key, "Session advisory lock held by another session");
            close_quietly(&conn).await;
            return Ok(None);
        }
        debug!(key, "Session advisory lock acquired");

        let result = f(ctx.clone()).await;

        // Unlock even when ctx was cancelled meanwhile.
        match conn
            .query(&Context::background())
            .scalar::<bool>(UNLOCK, &[QueryParam::Int(key)])
            .await
        {
            Ok(true) => debug!(key, "Session advisory lock released"),
            Ok(false) => warn!(key, "Session advisory lock was not held at unlock"),
            Err(e) => warn!(key, error = %e, "Failed to release session advisory lock"),
        }
        close_quietly(&conn).await;

        result.map(Some)
    }
}

async fn close_quietly(conn: &PgConn) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "Failed to close lock connection");
    }
}

impl std::fmt::Debug for PgLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLocker")
            .field("database_url", &url::mask_password(&self.database_url))
            .finish()
    }
}
