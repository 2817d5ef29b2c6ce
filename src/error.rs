//! Error types for txscope.
//!
//! Every backend-native failure is normalized into [`DbError`] at the query
//! boundary, so code above the query facade never inspects `sqlx` errors.
//! Fatal variants (see [`DbError::is_fatal`]) signal wiring bugs rather than
//! runtime conditions and should never be retried.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("no rows in result set")]
    NoRows,

    #[error("no connection found in context")]
    NoConnection,

    #[error("Advisory lock {lock_id} is held by another session")]
    LockFailed { lock_id: i64 },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        transaction_id: Option<String>,
    },

    #[error("Transaction {transaction_id} is already closed")]
    TransactionClosed { transaction_id: String },

    #[error("Context is already in transaction {transaction_id}; nested transactions are not supported")]
    NestedTransaction { transaction_id: String },

    #[error("Advisory locks are not supported by the {backend} backend")]
    LockUnsupported { backend: &'static str },

    #[error("Invalid context: {message}")]
    InvalidContext { message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} timed out")]
    Timeout { operation: String },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Deadline exceeded: {operation}")]
    DeadlineExceeded { operation: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: Option<&str>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.map(String::from),
        }
    }

    pub fn transaction_closed(transaction_id: impl Into<String>) -> Self {
        Self::TransactionClosed {
            transaction_id: transaction_id.into(),
        }
    }

    pub fn nested_transaction(transaction_id: impl Into<String>) -> Self {
        Self::NestedTransaction {
            transaction_id: transaction_id.into(),
        }
    }

    pub fn invalid_context(message: impl Into<String>) -> Self {
        Self::InvalidContext {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// True when a single-row query matched nothing.
    pub fn is_no_rows(&self) -> bool {
        matches!(self, Self::NoRows)
    }

    /// True when an advisory lock was held elsewhere.
    pub fn is_lock_failed(&self) -> bool {
        matches!(self, Self::LockFailed { .. })
    }

    /// Conditions that only occur in incorrect code: a transaction opened
    /// inside another, a lock requested from a backend without lock support,
    /// or a context carrying another backend's transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NestedTransaction { .. }
                | Self::LockUnsupported { .. }
                | Self::InvalidContext { .. }
        )
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::LockFailed { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NoRows,
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            // The limit is the pool's configured acquire timeout.
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire"),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::internal(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::Migrate(err) => DbError::migration(err.to_string()),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::migration(err.to_string())
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
