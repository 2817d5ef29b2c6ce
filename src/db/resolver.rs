//! Context-scoped source resolution.
//!
//! A query facade asks the resolver which source to run against. The bound
//! transaction wins over the caller's default; a transaction that belongs to
//! another backend is a wiring bug and resolves to [`Resolved::Foreign`].

use crate::context::{Binding, Context};
use crate::error::{DbError, DbResult};
use tracing::error;

/// Outcome of resolving a context against one backend.
#[derive(Debug)]
pub(crate) enum Resolved<S> {
    Bound(S),
    Unbound,
    Foreign {
        expected: &'static str,
        found: &'static str,
        transaction_id: String,
    },
}

impl<S> Resolved<S> {
    pub(crate) fn source(&self) -> DbResult<&S> {
        match self {
            Resolved::Bound(source) => Ok(source),
            Resolved::Unbound => Err(DbError::NoConnection),
            Resolved::Foreign {
                expected,
                found,
                transaction_id,
            } => Err(DbError::invalid_context(format!(
                "context carries {} transaction {} but the query targets {}",
                found, transaction_id, expected
            ))),
        }
    }
}

/// Pick the source for a facade built from `ctx`.
///
/// `extract` returns the transaction source when the binding belongs to
/// `backend`, `None` otherwise.
pub(crate) fn resolve<S>(
    ctx: &Context,
    backend: &'static str,
    extract: impl FnOnce(&Binding) -> Option<S>,
    default: Option<S>,
) -> Resolved<S> {
    let Some(binding) = ctx.binding() else {
        return default.map_or(Resolved::Unbound, Resolved::Bound);
    };

    match extract(binding) {
        Some(source) => Resolved::Bound(source),
        None => {
            error!(
                expected = backend,
                found = binding.backend(),
                transaction_id = binding.transaction_id(),
                "Context carries a transaction of another backend"
            );
            Resolved::Foreign {
                expected: backend,
                found: binding.backend(),
                transaction_id: binding.transaction_id().to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::transaction::TxSlot;
    use crate::db::transaction::mock::{Counters, MockConn};
    use std::sync::Arc;

    fn mock_binding() -> Binding {
        Binding::Mock(TxSlot::open(MockConn {
            counters: Arc::new(Counters::default()),
            fail_commit: false,
            fail_rollback: false,
        }))
    }

    fn extract_mock(binding: &Binding) -> Option<&'static str> {
        match binding {
            Binding::Mock(_) => Some("tx"),
            _ => None,
        }
    }

    #[test]
    fn test_unbound_without_default() {
        let ctx = Context::background();
        let resolved = resolve::<&str>(&ctx, "mock", extract_mock, None);
        assert!(matches!(resolved.source(), Err(DbError::NoConnection)));
    }

    #[test]
    fn test_default_used_outside_transaction() {
        let ctx = Context::background();
        let resolved = resolve(&ctx, "mock", extract_mock, Some("pool"));
        assert_eq!(*resolved.source().unwrap(), "pool");
    }

    #[test]
    fn test_transaction_overrides_default() {
        let ctx = Context::background().with_binding(mock_binding());
        let resolved = resolve(&ctx, "mock", extract_mock, Some("pool"));
        assert_eq!(*resolved.source().unwrap(), "tx");
    }

    #[test]
    fn test_foreign_binding_is_fatal() {
        let ctx = Context::background().with_binding(mock_binding());
        let resolved = resolve::<&str>(&ctx, "PostgreSQL", |_| None, Some("pool"));
        let err = resolved.source().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, DbError::InvalidContext { .. }));
    }
}
