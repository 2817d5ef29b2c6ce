//! Data models for txscope.
//!
//! This module re-exports the value types shared by every backend.

pub mod connection;
pub mod query;

pub use connection::{DatabaseType, TransactionState};
pub use query::{ParamKind, ParamType, QueryParam};
