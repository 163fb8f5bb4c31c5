//! Storage errors

use thiserror::Error;

/// Postgres SQLSTATE codes that are worth retrying
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
const SQLSTATE_QUERY_CANCELED: &str = "57014";
const SQLSTATE_ADMIN_SHUTDOWN: &str = "57P01";
const SQLSTATE_CRASH_SHUTDOWN: &str = "57P02";
const SQLSTATE_CANNOT_CONNECT_NOW: &str = "57P03";

/// Class 08: connection exception
const SQLSTATE_CLASS_CONNECTION: &str = "08";
/// Class 53: insufficient resources (too_many_connections, out_of_memory, ...)
const SQLSTATE_CLASS_RESOURCES: &str = "53";

/// How a server-reported SQLSTATE maps onto [`StoreError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqlStateClass {
    LockTimeout,
    Unavailable,
    Retryable,
    Permanent,
}

fn classify_sqlstate(code: &str) -> SqlStateClass {
    match code {
        SQLSTATE_LOCK_NOT_AVAILABLE | SQLSTATE_QUERY_CANCELED => SqlStateClass::LockTimeout,
        SQLSTATE_SERIALIZATION_FAILURE | SQLSTATE_DEADLOCK_DETECTED => SqlStateClass::Retryable,
        SQLSTATE_ADMIN_SHUTDOWN | SQLSTATE_CRASH_SHUTDOWN | SQLSTATE_CANNOT_CONNECT_NOW => {
            SqlStateClass::Unavailable
        }
        _ if code.starts_with(SQLSTATE_CLASS_CONNECTION)
            || code.starts_with(SQLSTATE_CLASS_RESOURCES) =>
        {
            SqlStateClass::Unavailable
        }
        _ => SqlStateClass::Permanent,
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Advisory or row lock was not granted within the configured timeout
    #[error("lock not acquired within timeout")]
    LockTimeout,

    /// The store could not be reached (pool exhausted, connection refused, ...)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be mapped to the domain model
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// Any other database error
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    /// Whether the caller should retry the whole operation
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::LockTimeout | StoreError::Unavailable(_) => true,
            StoreError::CorruptRow(_) => false,
            StoreError::Database(e) => e
                .as_database_error()
                .and_then(|db| db.code())
                .is_some_and(|code| classify_sqlstate(&code) != SqlStateClass::Permanent),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::Database(db) => {
                let class = db
                    .code()
                    .map_or(SqlStateClass::Permanent, |code| classify_sqlstate(&code));
                match class {
                    SqlStateClass::LockTimeout => StoreError::LockTimeout,
                    SqlStateClass::Unavailable => StoreError::Unavailable(e.to_string()),
                    SqlStateClass::Retryable | SqlStateClass::Permanent => StoreError::Database(e),
                }
            }
            _ => StoreError::Database(e),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
