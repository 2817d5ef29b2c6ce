//! Call context threaded through every database operation.
//!
//! A [`Context`] carries three things:
//! - a cancellation token
//! - an optional deadline
//! - at most one bound transaction
//!
//! Contexts are immutable; every `with_*` method returns a derived child and
//! leaves the receiver untouched, so code outside a transaction callback keeps
//! seeing "no active transaction" while code inside sees the open one.
//!
//! The transaction binding is crate-private. Only the transaction manager in
//! [`crate::db::transaction`] can create one.

use crate::db::postgres::PgTxConn;
use crate::db::transaction::TxSlot;
use crate::error::{DbError, DbResult};
use crate::db::sqlite::SqliteTx;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Transaction bound into a context, one variant per backend.
#[derive(Clone)]
pub(crate) enum Binding {
    Postgres(TxSlot<PgTxConn>),
    Sqlite(TxSlot<SqliteTx>),
    #[cfg(test)]
    Mock(TxSlot<crate::db::transaction::mock::MockConn>),
}

impl Binding {
    pub(crate) fn transaction_id(&self) -> &str {
        match self {
            Binding::Postgres(slot) => slot.id(),
            Binding::Sqlite(slot) => slot.id(),
            #[cfg(test)]
            Binding::Mock(slot) => slot.id(),
        }
    }

    pub(crate) fn backend(&self) -> &'static str {
        match self {
            Binding::Postgres(_) => "PostgreSQL",
            Binding::Sqlite(_) => "SQLite",
            #[cfg(test)]
            Binding::Mock(_) => "mock",
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("backend", &self.backend())
            .field("transaction_id", &self.transaction_id())
            .finish()
    }
}

/// Chainable, cancellation-aware carrier for one logical call chain.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    binding: Option<Binding>,
}

impl Context {
    /// Root context: never cancelled unless [`Context::cancel`] is called,
    /// no deadline, no transaction.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            binding: None,
        }
    }

    /// Derive a child that can be cancelled on its own. Cancelling the
    /// parent still cancels the child.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            binding: self.binding.clone(),
        }
    }

    /// Derive a child whose operations fail once `timeout` has elapsed.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child with a deadline. An earlier deadline inherited from
    /// the parent wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        child
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a transaction is bound to this context.
    pub fn in_transaction(&self) -> bool {
        self.binding.is_some()
    }

    /// Identifier of the bound transaction, if any.
    pub fn transaction_id(&self) -> Option<&str> {
        self.binding.as_ref().map(Binding::transaction_id)
    }

    pub(crate) fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// Child with the same deadline and no transaction.
    pub(crate) fn unbound(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            binding: None,
        }
    }

    /// Child bound to `binding`. Cancelling it leaves `self` untouched.
    pub(crate) fn with_binding(&self, binding: Binding) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            binding: Some(binding),
        }
    }

    /// Run one blocking database operation under this context.
    ///
    /// Fails with [`DbError::Cancelled`] or [`DbError::DeadlineExceeded`] as
    /// soon as either fires; the operation's future is dropped at that point.
    pub(crate) async fn run<T, F>(&self, operation: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(DbError::cancelled(operation));
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(DbError::deadline_exceeded(operation)),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DbError::cancelled(operation)),
            result = bounded => result,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
