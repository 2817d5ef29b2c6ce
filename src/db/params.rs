//! Parameter binding utilities for database queries.
//!
//! Converts a slice of `QueryParam` into backend argument buffers. Arguments
//! are bound positionally; the statement text is never inspected.

use crate::error::{DbError, DbResult};
use crate::models::{ParamKind, QueryParam};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::Arguments;
use sqlx::error::BoxDynError;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;

fn bind_error(index: usize, param: &QueryParam, err: BoxDynError) -> DbError {
    DbError::invalid_input(format!(
        "Failed to bind {} parameter ${}: {}",
        param.type_name(),
        index + 1,
        err
    ))
}

/// Bind a NULL declared with the PostgreSQL type of `kind`.
fn add_postgres_null(args: &mut PgArguments, kind: ParamKind) -> Result<(), BoxDynError> {
    match kind {
        ParamKind::Bool => args.add(None::<bool>),
        ParamKind::Int => args.add(None::<i64>),
        ParamKind::Float => args.add(None::<f64>),
        ParamKind::String => args.add(None::<String>),
        ParamKind::Bytes => args.add(None::<Vec<u8>>),
        ParamKind::Json => args.add(None::<Json<JsonValue>>),
        ParamKind::Date => args.add(None::<NaiveDate>),
        ParamKind::Timestamp => args.add(None::<DateTime<Utc>>),
    }
}

/// Build PostgreSQL arguments.
pub(crate) fn postgres_arguments(params: &[QueryParam]) -> DbResult<PgArguments> {
    let mut args = PgArguments::default();
    for (index, param) in params.iter().enumerate() {
        let bound = match param {
            QueryParam::Null(kind) => add_postgres_null(&mut args, *kind),
            QueryParam::Bool(v) => args.add(*v),
            QueryParam::Int(v) => args.add(*v),
            QueryParam::Float(v) => args.add(*v),
            QueryParam::String(v) => args.add(v.as_str()),
            QueryParam::Bytes(v) => args.add(v.as_slice()),
            QueryParam::Json(v) => args.add(Json(v)),
            QueryParam::Date(v) => args.add(*v),
            QueryParam::Timestamp(v) => args.add(*v),
        };
        bound.map_err(|e| bind_error(index, param, e))?;
    }
    Ok(args)
}

/// Build SQLite arguments borrowing from `params`.
pub(crate) fn sqlite_arguments<'q>(params: &'q [QueryParam]) -> DbResult<SqliteArguments<'q>> {
    let mut args = SqliteArguments::default();
    for (index, param) in params.iter().enumerate() {
        let bound = match param {
            // SQLite NULLs carry no type
            QueryParam::Null(_) => args.add(None::<i64>),
            QueryParam::Bool(v) => args.add(*v),
            QueryParam::Int(v) => args.add(*v),
            QueryParam::Float(v) => args.add(*v),
            QueryParam::String(v) => args.add(v.as_str()),
            QueryParam::Bytes(v) => args.add(v.as_slice()),
            // SQLite doesn't have native JSON type, store as string
            QueryParam::Json(v) => args.add(v.to_string()),
            QueryParam::Date(v) => args.add(*v),
            QueryParam::Timestamp(v) => args.add(*v),
        };
        bound.map_err(|e| bind_error(index, param, e))?;
    }
    Ok(args)
}
