//! Transaction manager shared by every backend.
//!
//! [`run_in_transaction`] does four things:
//! - opens a transaction
//! - binds it into a child [`Context`]
//! - runs the caller's callback with that child
//! - commits or rolls back depending on the callback's result
//!
//! The open transaction lives in a [`TxSlot`]. Every query facade resolved
//! from the child context shares the slot. Once the slot is committed or
//! rolled back, later use through any clone fails with
//! [`DbError::TransactionClosed`].
//!
//! # Safety net
//!
//! An [`AbandonGuard`] is armed for the duration of the callback. If the
//! future is dropped (cancelled by the caller or unwound by a panic) while
//! the transaction is still active, the guard takes the connection out of
//! the slot and rolls it back on the current runtime.

use crate::context::{Binding, Context};
use crate::error::{DbError, DbResult};
use crate::models::TransactionState;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Connection holding an open backend transaction.
pub(crate) trait TxConn: Send + 'static {
    fn commit(self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
    fn rollback(self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
}

struct SlotInner<C> {
    conn: Option<C>,
    state: TransactionState,
}

/// Shared handle to one open transaction.
pub(crate) struct TxSlot<C> {
    id: Arc<str>,
    inner: Arc<Mutex<SlotInner<C>>>,
}

impl<C> Clone for TxSlot<C> {
    fn clone(&self) -> Self {
        Self {
            id: Arc::clone(&self.id),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: TxConn> TxSlot<C> {
    pub(crate) fn open(conn: C) -> Self {
        Self {
            id: generate_transaction_id().into(),
            inner: Arc::new(Mutex::new(SlotInner {
                conn: Some(conn),
                state: TransactionState::Active,
            })),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    #[cfg(test)]
    pub(crate) async fn state(&self) -> TransactionState {
        self.inner.lock().await.state
    }

    /// Lock the transaction connection for one statement.
    ///
    /// Statements issued through the same slot are serialized by this lock.
    pub(crate) async fn acquire(&self) -> DbResult<MappedMutexGuard<'_, C>> {
        let guard = self.inner.lock().await;
        if !guard.state.is_active() {
            debug!(
                transaction_id = self.id(),
                state = %guard.state,
                "Transaction already ended"
            );
            return Err(DbError::transaction_closed(self.id()));
        }
        MutexGuard::try_map(guard, |inner| inner.conn.as_mut())
            .map_err(|_| DbError::transaction_closed(self.id()))
    }

    pub(crate) async fn commit(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let conn = inner
            .conn
            .take()
            .ok_or_else(|| DbError::transaction_closed(self.id()))?;
        // A failed or interrupted commit leaves nothing to reuse.
        inner.state = TransactionState::RolledBack;
        conn.commit().await.map_err(|e| {
            DbError::transaction(format!("commit failed: {}", e), Some(self.id()))
        })?;
        inner.state = TransactionState::Committed;
        Ok(())
    }

    pub(crate) async fn rollback(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        let conn = inner
            .conn
            .take()
            .ok_or_else(|| DbError::transaction_closed(self.id()))?;
        inner.state = TransactionState::RolledBack;
        conn.rollback().await.map_err(|e| {
            DbError::transaction(format!("rollback failed: {}", e), Some(self.id()))
        })
    }

    /// Take the connection out without awaiting. `Err` when a statement
    /// still holds the slot.
    fn abandon(&self) -> Result<Option<C>, ()> {
        let mut inner = self.inner.try_lock().map_err(|_| ())?;
        if !inner.state.is_active() {
            return Ok(None);
        }
        inner.state = TransactionState::RolledBack;
        Ok(inner.conn.take())
    }
}

struct AbandonGuard<C: TxConn> {
    slot: TxSlot<C>,
    backend: &'static str,
}

impl<C: TxConn> Drop for AbandonGuard<C> {
    fn drop(&mut self) {
        let backend = self.backend;
        let transaction_id = self.slot.id().to_string();

        let conn = match self.slot.abandon() {
            Ok(Some(conn)) => conn,
            Ok(None) => return,
            Err(()) => {
                warn!(
                    backend,
                    transaction_id = %transaction_id,
                    "Transaction still in use at scope exit; it rolls back when released"
                );
                return;
            }
        };

        warn!(
            backend,
            transaction_id = %transaction_id,
            "Transaction abandoned while active, rolling back"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.rollback().await {
                        error!(
                            backend,
                            transaction_id = %transaction_id,
                            error = %e,
                            "Error while rolling back abandoned transaction"
                        );
                    }
                });
            }
            // sqlx rolls back a dropped transaction when the connection is next used
            Err(_) => drop(conn),
        }
    }
}

/// Run `f` inside a new transaction.
///
/// `begin` is only polled after the nesting check, so a nested call never
/// touches the backend. `bind` wraps the new slot in the backend's
/// [`Binding`] variant.
pub(crate) async fn run_in_transaction<C, B, T, E, F, Fut>(
    ctx: &Context,
    backend: &'static str,
    begin: B,
    bind: fn(TxSlot<C>) -> Binding,
    f: F,
) -> Result<T, E>
where
    C: TxConn,
    B: Future<Output = DbResult<C>>,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DbError>,
{
    if let Some(existing) = ctx.transaction_id() {
        error!(
            backend,
            transaction_id = %existing,
            "Database context is already in a transaction"
        );
        return Err(DbError::nested_transaction(existing).into());
    }

    let conn = ctx.run("begin transaction", begin).await.map_err(|e| {
        warn!(backend, error = %e, "Can't obtain a transaction on the database");
        e
    })?;

    let slot = TxSlot::open(conn);
    let _guard = AbandonGuard {
        slot: slot.clone(),
        backend,
    };
    debug!(backend, transaction_id = slot.id(), "Transaction started");

    let child = ctx.with_binding(bind(slot.clone()));
    match f(child).await {
        Ok(value) => match ctx.run("commit transaction", slot.commit()).await {
            Ok(()) => {
                debug!(backend, transaction_id = slot.id(), "Transaction committed");
                Ok(value)
            }
            Err(err) => {
                warn!(
                    backend,
                    transaction_id = slot.id(),
                    error = %err,
                    "Commit failed"
                );
                discard(&slot, backend).await;
                Err(err.into())
            }
        },
        Err(err) => {
            discard(&slot, backend).await;
            Err(err)
        }
    }
}

/// Roll back after a failure. Errors are logged, never returned, so they
/// cannot mask the failure that triggered the rollback.
async fn discard<C: TxConn>(slot: &TxSlot<C>, backend: &'static str) {
    match slot.rollback().await {
        Ok(()) => debug!(backend, transaction_id = slot.id(), "Transaction rolled back"),
        Err(DbError::TransactionClosed { .. }) => {}
        Err(err) => error!(
            backend,
            transaction_id = slot.id(),
            error = %err,
            "Error while rolling back"
        ),
    }
}

/// Generate a unique transaction ID.
pub(crate) fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}


#[cfg(test)]
mod tests {
    use super::mock::{Counters, MockConn};
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    enum AppError {
        Db(DbError),
        Rejected(u32),
    }

    impl From<DbError> for AppError {
        fn from(err: DbError) -> Self {
            AppError::Db(err)
        }
    }

    fn begin(
        counters: &Arc<Counters>,
        fail_commit: bool,
        fail_rollback: bool,
    ) -> impl Future<Output = DbResult<MockConn>> + Send + 'static {
        let counters = Arc::clone(counters);
        async move {
            counters.begins.fetch_add(1, Ordering::SeqCst);
            Ok(MockConn {
                counters,
                fail_commit,
                fail_rollback,
            })
        }
    }

    async fn wait_for_rollbacks(counters: &Counters, expected: usize) {
        for _ in 0..100 {
            if counters.rollbacks() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32); // "tx_" + 32 hex chars
    }

    #[tokio::test]
    async fn test_success_commits_exactly_once() {
        let counters = Arc::new(Counters::default());
        let ctx = Context::background();

        let value = run_in_transaction(
            &ctx,
            "mock",
            begin(&counters, false, false),
            Binding::Mock,
            |tx_ctx| async move {
                assert!(tx_ctx.in_transaction());
                Ok::<_, DbError>(7)
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(counters.begins(), 1);
        assert_eq!(counters.commits(), 1);
        assert_eq!(counters.rollbacks(), 0);
        assert!(!ctx.in_transaction());
    }

    #[tokio::test]
    async fn test_error_rolls_back_and_returns_original_error() {
        let counters = Arc::new(Counters::default());
        let ctx = Context::background();

        let result: Result<(), AppError> = run_in_transaction(
            &ctx,
            "mock",
            begin(&counters, false, false),
            Binding::Mock,
            |_| async { Err(AppError::Rejected(13)) },
        )
        .await;

        assert!(matches!(result, Err(AppError::Rejected(13))));
        assert_eq!(counters.commits(), 0);
        assert_eq!(counters.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_mask_original_error() {
        let counters = Arc::new(Counters::default());
        let ctx = Context::background();

        let result: Result<(), AppError> = run_in_transaction(
            &ctx,
            "mock",
            begin(&counters, false, true),
            Binding::Mock,
            |_| async { Err(AppError::Rejected(5)) },
        )
        .await;

        assert!(matches!(result, Err(AppError::Rejected(5))));
        assert_eq!(counters.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_is_surfaced() {
        let counters = Arc::new(Counters::default());
        let ctx = Context::background();

        let result = run_in_transaction(
            &ctx,
            "mock",
            begin(&counters, true, false),
            Binding::Mock,
            |_| async { Ok::<_, DbError>(()) },
        )
        .await;

        assert!(matches!(result, Err(DbError::Transaction { .. })));
        assert_eq!(counters.commits(), 1);
        // the failed commit consumed the connection
        assert_eq!(counters.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_nested_transaction_fails_before_begin() {
        let counters = Arc::new(Counters::default());
        let ctx = Context::background();
        let inner_counters = Arc::clone(&counters);

        let result: Result<(), DbError> = run_in_transaction(
            &ctx,
            "mock",
            begin(&counters, false, false),
            Binding::Mock,
            |tx_ctx| async move {
                let polled = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&polled);
                let nested = run_in_transaction(
                    &tx_ctx,
                    "mock",
                    async move {
                        flag.store(true, Ordering::SeqCst);
                        Ok(MockConn {
                            counters: inner_counters,
                            fail_commit: false,
                            fail_rollback: false,
                        })
                    },
                    Binding::Mock,
                    |_| async { Ok::<_, DbError>(()) },
                )
                .await;

                assert!(!polled.load(Ordering::SeqCst));
                match nested {
                    Err(err) => {
                        assert!(err.is_fatal());
                        assert!(matches!(err, DbError::NestedTransaction { .. }));
                        Err(err)
                    }
                    Ok(()) => panic!("nested transaction was accepted"),
                }
            },
        )
        .await;

        assert!(matches!(result, Err(DbError::NestedTransaction { .. })));
        assert_eq!(counters.begins(), 1);
        assert_eq!(counters.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_never_begins() {
        let counters = Arc::new(Counters::default());
        let ctx = Context::background();
        ctx.cancel();

        let result = run_in_transaction(
            &ctx,
            "mock",
            begin(&counters, false, false),
            Binding::Mock,
            |_| async { Ok::<_, DbError>(()) },
        )
        .await;

        assert!(matches!(result, Err(DbError::Cancelled { .. })));
        assert_eq!(counters.begins(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_inside_callback_rolls_back() {
        let counters = Arc::new(Counters::default());
        let ctx = Context::background();

        let result = run_in_transaction(
            &ctx,
            "mock",
            begin(&counters, false, false),
            Binding::Mock,
            |tx_ctx| async move {
                tx_ctx.cancel();
                tx_ctx.run("exec", async { Ok(()) }).await?;
                Ok::<_, DbError>(())
            },
        )
        .await;

        assert!(matches!(result, Err(DbError::Cancelled { .. })));
        assert_eq!(counters.commits(), 0);
        assert_eq!(counters.rollbacks(), 1);
        assert!(!ctx.is_cancelled(), "cancelling the transaction context leaked to the caller");

        // The caller's context is still usable.
        let value = run_in_transaction(
            &ctx,
            "mock",
            begin(&counters, false, false),
            Binding::Mock,
            |_| async { Ok::<_, DbError>(1) },
        )
        .await
        .unwrap();
        assert_eq!(value, 1);
        assert_eq!(counters.commits(), 1);
    }

    #[tokio::test]
    async fn test_caller_cancellation_reaches_callback_and_rolls_back() {
        let counters = Arc::new(Counters::default());
        let ctx = Context::background();
        let caller = ctx.clone();

        let result = run_in_transaction(
            &ctx,
            "mock",
            begin(&counters, false, false),
            Binding::Mock,
            |tx_ctx| async move {
                caller.cancel();
                assert!(tx_ctx.is_cancelled());
                Ok::<_, DbError>(())
            },
        )
        .await;

        assert!(matches!(result, Err(DbError::Cancelled { .. })));
        assert_eq!(counters.commits(), 0);
        assert_eq!(counters.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_panic_in_callback_rolls_back() {
        let counters = Arc::new(Counters::default());
        let task_counters = Arc::clone(&counters);

        let handle = tokio::spawn(async move {
            let ctx = Context::background();
            run_in_transaction(
                &ctx,
                "mock",
                begin(&task_counters, false, false),
                Binding::Mock,
                |_| async {
                    if task_counters.begins() == 1 {
                        panic!("callback blew up");
                    }
                    Ok::<_, DbError>(())
                },
            )
            .await
        });

        let joined = handle.await;
        assert!(joined.unwrap_err().is_panic());
        wait_for_rollbacks(&counters, 1).await;
        assert_eq!(counters.commits(), 0);
        assert_eq!(counters.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_dropped_future_rolls_back() {
        let counters = Arc::new(Counters::default());
        let ctx = Context::background();

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            run_in_transaction(
                &ctx,
                "mock",
                begin(&counters, false, false),
                Binding::Mock,
                |_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, DbError>(())
                },
            ),
        )
        .await;

        assert!(result.is_err());
        wait_for_rollbacks(&counters, 1).await;
        assert_eq!(counters.commits(), 0);
        assert_eq!(counters.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_slot_is_terminal_after_commit() {
        let counters = Arc::new(Counters::default());
        let conn = begin(&counters, false, false).await.unwrap();
        let slot = TxSlot::open(conn);
        let leaked = slot.clone();

        assert_eq!(slot.state().await, TransactionState::Active);
        slot.commit().await.unwrap();
        assert_eq!(leaked.state().await, TransactionState::Committed);

        assert!(matches!(
            leaked.acquire().await,
            Err(DbError::TransactionClosed { .. })
        ));
        assert!(matches!(
            leaked.rollback().await,
            Err(DbError::TransactionClosed { .. })
        ));
        assert!(matches!(
            slot.commit().await,
            Err(DbError::TransactionClosed { .. })
        ));
        assert_eq!(counters.commits(), 1);
        assert_eq!(counters.rollbacks(), 0);
    }
}
