//! Macros shared by the query facades.
//!
//! The executor macros expand one statement body once per source variant so
//! each arm gets its concrete `sqlx` executor type. Bodies call `Executor`
//! methods on `$exec` directly.

/// Build a `Vec<QueryParam>` from values convertible into [`QueryParam`].
///
/// [`QueryParam`]: crate::models::QueryParam
///
/// # Example
///
/// ```
/// use txscope::params;
///
/// let args = params![1i64, "hello world", None::<String>];
/// assert_eq!(args.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::models::QueryParam>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::models::QueryParam::from($value)),+]
    };
}

/// Run `$body` with `$exec` bound to the executor behind a PostgreSQL target.
///
/// Must be used inside an async fn returning `DbResult`.
macro_rules! with_pg_executor {
    ($target:expr, |$exec:ident| $body:expr) => {
        match $target {
            $crate::db::postgres::Target::Source($crate::db::postgres::PgSource::Pool(pool)) => {
                let $exec = pool;
                $body
            }
            $crate::db::postgres::Target::Source($crate::db::postgres::PgSource::Conn(conn)) => {
                let mut guard = conn.checkout().await;
                let $exec = guard.ready().await?;
                $body
            }
            $crate::db::postgres::Target::Tx(slot) => {
                let mut guard = slot.acquire().await?;
                let $exec = guard.conn_mut()?;
                $body
            }
        }
    };
}

/// Run `$body` with `$exec` bound to the executor behind a SQLite target.
///
/// Must be used inside an async fn returning `DbResult`.
macro_rules! with_sqlite_executor {
    ($target:expr, |$exec:ident| $body:expr) => {
        match $target {
            $crate::db::sqlite::Target::Pool(pool) => {
                let $exec = pool;
                $body
            }
            $crate::db::sqlite::Target::Tx(slot) => {
                let mut guard = slot.acquire().await?;
                let $exec = &mut **guard;
                $body
            }
        }
    };
}

pub(crate) use with_pg_executor;
pub(crate) use with_sqlite_executor;
