//! SQLite backend.
//!
//! Same query and transaction contracts as PostgreSQL. SQLite has no
//! advisory locks, so [`SqliteDb::with_lock`] refuses instead of running the
//! callback unprotected.

use crate::config::DatabaseConfig;
use crate::context::{Binding, Context};
use crate::db::exactly_one;
use crate::db::macros::with_sqlite_executor;
use crate::db::params::sqlite_arguments;
use crate::db::pool::{connection_suggestion, sqlite_pool_options};
use crate::db::resolver::{self, Resolved};
use crate::db::transaction::{self, TxConn, TxSlot};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam};
use futures_util::{StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Connection, Executor, FromRow, Sqlite, SqlitePool, Transaction};
use std::future::Future;
use std::str::FromStr;
use tracing::{debug, error, info};

const BACKEND: &str = "SQLite";

/// Connection holding an open SQLite transaction.
pub(crate) struct SqliteTx(Transaction<'static, Sqlite>);

impl std::ops::Deref for SqliteTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.0
    }
}

impl std::ops::DerefMut for SqliteTx {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.0
    }
}

impl TxConn for SqliteTx {
    async fn commit(self) -> Result<(), sqlx::Error> {
        self.0.commit().await
    }

    async fn rollback(self) -> Result<(), sqlx::Error> {
        self.0.rollback().await
    }
}

fn connect_error(err: &sqlx::Error) -> DbError {
    DbError::connection(
        format!("Failed to connect: {}", err),
        connection_suggestion(DatabaseType::SQLite, err),
    )
}

/// Normalize a bare file path into a `sqlite:` URL.
fn to_url(path_or_url: &str) -> String {
    match DatabaseType::from_connection_string(path_or_url) {
        Some(DatabaseType::SQLite) => path_or_url.to_string(),
        _ => format!("sqlite:{}", path_or_url),
    }
}

/// SQLite file handle. The file is created when missing.
#[derive(Clone)]
pub struct SqliteDb {
    pool: SqlitePool,
    path: String,
}

impl SqliteDb {
    /// Open `path_or_url` (`sqlite:` URL or bare path) and ping it.
    pub async fn connect(ctx: &Context, path_or_url: &str) -> DbResult<Self> {
        let config = DatabaseConfig::parse(&to_url(path_or_url)).map_err(|e| {
            DbError::connection(
                e,
                "Check the connection URL format: sqlite:path/to/db.sqlite",
            )
        })?;
        Self::connect_with(ctx, &config).await
    }

    pub async fn connect_with(ctx: &Context, config: &DatabaseConfig) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.connection_string)
            .map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Check the connection URL format: sqlite:path/to/db.sqlite",
                )
            })?
            .create_if_missing(true);

        let path = options.get_filename().display().to_string();
        info!(path = %path, "Connecting to SQLite");

        let pool = ctx
            .run("connect", async {
                sqlite_pool_options(&config.pool_options)
                    .connect_with(options)
                    .await
                    .map_err(|e| connect_error(&e))
            })
            .await?;

        let db = Self { pool, path };
        db.ping(ctx).await?;
        Ok(db)
    }

    pub async fn ping(&self, ctx: &Context) -> DbResult<()> {
        ctx.run("ping", async {
            let mut conn = self.pool.acquire().await.map_err(|e| connect_error(&e))?;
            conn.ping().await.map_err(|e| connect_error(&e))
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path, "Closed SQLite pool");
    }

    pub fn query(&self, ctx: &Context) -> SqliteQuery {
        query_from_context(ctx, Some(self.pool.clone()))
    }

    /// Run `f` inside a transaction on one pooled connection.
    pub async fn run_in_transaction<T, E, F, Fut>(&self, ctx: &Context, f: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let pool = self.pool.clone();
        let begin = async move {
            pool.begin().await.map(SqliteTx).map_err(|e| {
                DbError::transaction(format!("begin failed: {}", e), None)
            })
        };
        transaction::run_in_transaction(ctx, BACKEND, begin, Binding::Sqlite, f).await
    }

    /// Always fails with [`DbError::LockUnsupported`]; `f` never runs.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        _ctx: &Context,
        lock_id: i64,
        _f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        error!(lock_id, "Advisory lock requested on SQLite, which has no lock support");
        Err(DbError::LockUnsupported { backend: BACKEND }.into())
    }
}

impl std::fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDb")
            .field("path", &self.path)
            .field("size", &self.pool.size())
            .finish()
    }
}

pub(crate) enum Target {
    Pool(SqlitePool),
    Tx(TxSlot<SqliteTx>),
}

/// Build a query facade for `ctx`, falling back to `default`.
pub fn query_from_context(ctx: &Context, default: Option<SqlitePool>) -> SqliteQuery {
    let target = resolver::resolve(
        ctx,
        BACKEND,
        |binding| match binding {
            Binding::Sqlite(slot) => Some(Target::Tx(slot.clone())),
            _ => None,
        },
        default.map(Target::Pool),
    );
    SqliteQuery {
        target,
        ctx: ctx.clone(),
    }
}

/// Query facade over whichever SQLite source the context resolved to.
pub struct SqliteQuery {
    target: Resolved<Target>,
    ctx: Context,
}

impl SqliteQuery {
    pub fn transaction_id(&self) -> Option<&str> {
        match &self.target {
            Resolved::Bound(Target::Tx(slot)) => Some(slot.id()),
            _ => None,
        }
    }

    pub async fn exec(&self, sql: &str, args: &[QueryParam]) -> DbResult<u64> {
        let target = self.target.source()?;
        debug!(sql, args = args.len(), transaction_id = ?self.transaction_id(), "exec");
        self.ctx.run("exec", exec_on(target, sql, args)).await
    }

    pub async fn select<T>(&self, sql: &str, args: &[QueryParam]) -> DbResult<Vec<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let target = self.target.source()?;
        debug!(sql, args = args.len(), transaction_id = ?self.transaction_id(), "select");
        self.ctx.run("select", select_on(target, sql, args)).await
    }

    pub async fn get<T>(&self, sql: &str, args: &[QueryParam]) -> DbResult<T>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let target = self.target.source()?;
        debug!(sql, args = args.len(), transaction_id = ?self.transaction_id(), "get");
        self.ctx.run("get", get_on(target, sql, args)).await
    }

    pub async fn scalar<T>(&self, sql: &str, args: &[QueryParam]) -> DbResult<T>
    where
        (T,): for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        self.get::<(T,)>(sql, args).await.map(|(value,)| value)
    }
}

// Statements go through `Executor` methods directly so the futures stay `Send`.
async fn exec_on(target: &Target, sql: &str, args: &[QueryParam]) -> DbResult<u64> {
    let arguments = sqlite_arguments(args)?;
    let result = with_sqlite_executor!(target, |exec| {
        exec.execute(sqlx::query_with(sql, arguments)).await?
    });
    Ok(result.rows_affected())
}

async fn select_on<T>(target: &Target, sql: &str, args: &[QueryParam]) -> DbResult<Vec<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let arguments = sqlite_arguments(args)?;
    let rows: Vec<SqliteRow> = with_sqlite_executor!(target, |exec| {
        exec.fetch_all(sqlx::query_with(sql, arguments)).await?
    });
    rows.iter()
        .map(|row| T::from_row(row).map_err(DbError::from))
        .collect()
}

async fn get_on<T>(target: &Target, sql: &str, args: &[QueryParam]) -> DbResult<T>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let arguments = sqlite_arguments(args)?;
    let rows: Vec<SqliteRow> = with_sqlite_executor!(target, |exec| {
        exec.fetch(sqlx::query_with(sql, arguments))
            .take(2)
            .try_collect()
            .await?
    });
    let row = exactly_one(rows)?;
    Ok(T::from_row(&row)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_to_url() {
        assert_eq!(to_url("/tmp/app.db"), "sqlite:/tmp/app.db");
        assert_eq!(to_url("sqlite:/tmp/app.db"), "sqlite:/tmp/app.db");
        assert_eq!(to_url("sqlite://data/app.db"), "sqlite://data/app.db");
    }

    #[tokio::test]
    async fn test_unbound_query_fails_with_no_connection() {
        let ctx = Context::background();
        let err = query_from_context(&ctx, None)
            .scalar::<i64>("SELECT 1", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NoConnection));
    }

    #[tokio::test]
    async fn test_with_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let ctx = Context::background();
        let db = SqliteDb::connect(&ctx, path.to_str().unwrap()).await.unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let result = db
            .with_lock(&ctx, 42, |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, DbError>(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, DbError::LockUnsupported { backend: "SQLite" }));
        assert!(!called.load(Ordering::SeqCst));
        db.close().await;
    }

    #[tokio::test]
    async fn test_futures_are_send() {
        let db = SqliteDb {
            pool: SqlitePoolOptions::new().connect_lazy("sqlite::memory:").unwrap(),
            path: ":memory:".to_string(),
        };
        let ctx = Context::background();

        let q = db.query(&ctx);
        assert_send(&q.exec("SELECT 1", &[]));
        assert_send(&q.select::<(i64,)>("SELECT 1", &[]));
        assert_send(&q.get::<(i64,)>("SELECT 1", &[]));
        assert_send(&q.scalar::<i64>("SELECT 1", &[]));
        assert_send(&db.ping(&ctx));

        assert_send(&db.run_in_transaction(&ctx, |tx_ctx| async move {
            query_from_context(&tx_ctx, None).exec("SELECT 1", &[]).await
        }));
        assert_send(&db.with_lock(&ctx, 1, |tx_ctx| async move {
            query_from_context(&tx_ctx, None).exec("SELECT 1", &[]).await
        }));
    }
}
