//! Positional query arguments.
//!
//! Statements are passed to the backend verbatim; arguments are bound in
//! order to `$1, $2, ...`.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;

/// Declared type of an argument.
///
/// A NULL still needs one on PostgreSQL, where every bound parameter carries
/// a type and a text-typed NULL cannot be assigned to, say, an integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Json,
    Date,
    Timestamp,
}

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    /// NULL of the given type
    Null(ParamKind),
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    Bytes(Vec<u8>),
    /// Bound as `jsonb` on PostgreSQL, as text on SQLite
    Json(JsonValue),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// The type this parameter is bound as, NULL or not.
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Null(kind) => *kind,
            Self::Bool(_) => ParamKind::Bool,
            Self::Int(_) => ParamKind::Int,
            Self::Float(_) => ParamKind::Float,
            Self::String(_) => ParamKind::String,
            Self::Bytes(_) => ParamKind::Bytes,
            Self::Json(_) => ParamKind::Json,
            Self::Date(_) => ParamKind::Date,
            Self::Timestamp(_) => ParamKind::Timestamp,
        }
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null(_) => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Date(_) => "date",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

/// Rust types with a fixed [`ParamKind`], so `None::<T>` binds as a NULL of
/// that type.
pub trait ParamType: Into<QueryParam> {
    const KIND: ParamKind;
}

macro_rules! param_types {
    ($($ty:ty => $variant:ident $(via $conv:expr)?),+ $(,)?) => {
        $(
            impl From<$ty> for QueryParam {
                fn from(v: $ty) -> Self {
                    Self::$variant($($conv)?(v))
                }
            }

            impl ParamType for $ty {
                const KIND: ParamKind = ParamKind::$variant;
            }
        )+
    };
}

param_types! {
    bool => Bool,
    i32 => Int via i64::from,
    i64 => Int,
    f64 => Float,
    String => String,
    Vec<u8> => Bytes,
    JsonValue => Json,
    NaiveDate => Date,
    DateTime<Utc> => Timestamp,
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl ParamType for &str {
    const KIND: ParamKind = ParamKind::String;
}

impl<T: ParamType> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null(T::KIND), Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_primitives() {
        assert_eq!(QueryParam::from(7), QueryParam::Int(7));
        assert_eq!(QueryParam::from(7i64), QueryParam::Int(7));
        assert_eq!(QueryParam::from(true), QueryParam::Bool(true));
        assert_eq!(
            QueryParam::from("hello"),
            QueryParam::String("hello".to_string())
        );
    }

    #[test]
    fn test_none_keeps_its_type() {
        assert_eq!(
            QueryParam::from(None::<i64>),
            QueryParam::Null(ParamKind::Int)
        );
        assert_eq!(
            QueryParam::from(None::<&str>),
            QueryParam::Null(ParamKind::String)
        );
        assert_eq!(
            QueryParam::from(None::<NaiveDate>).kind(),
            ParamKind::Date
        );
        assert!(QueryParam::from(None::<bool>).is_null());
        assert_eq!(QueryParam::from(Some(3i64)), QueryParam::Int(3));
    }

    #[test]
    fn test_type_names() {
        let date = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        assert_eq!(QueryParam::from(date).type_name(), "date");
        assert_eq!(QueryParam::Null(ParamKind::Int).type_name(), "null");
        assert_eq!(
            QueryParam::from(serde_json::json!({"a": 1})).type_name(),
            "json"
        );
    }
}
