//! Store-level errors
//!
//! Every backend reports failures through [`DbError`]. PostgreSQL errors are
//! classified by SQLSTATE so callers can tell constraint violations from
//! transient concurrency failures without string matching.

use thiserror::Error;

/// PostgreSQL SQLSTATE codes the ledger cares about.
pub mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const QUERY_CANCELED: &str = "57014";
    pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("no rows in result set")]
    NotFound,

    #[error("unique violation on {constraint}: {message}")]
    UniqueViolation { constraint: String, message: String },

    #[error("foreign key violation on {constraint}: {message}")]
    ForeignKeyViolation { constraint: String, message: String },

    #[error("check violation on {constraint}: {message}")]
    CheckViolation { constraint: String, message: String },

    #[error("could not serialize access: {0}")]
    SerializationFailure(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("lock not available: {0}")]
    LockNotAvailable(String),

    #[error("query canceled: {0}")]
    QueryCanceled(String),

    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Anything unclassified. `code` is the SQLSTATE when the server sent one.
    #[error("database error: {message}")]
    Other {
        code: Option<String>,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },
}

impl DbError {
    /// Constraint violations: the request conflicts with existing data.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DbError::UniqueViolation { .. }
                | DbError::ForeignKeyViolation { .. }
                | DbError::CheckViolation { .. }
        )
    }

    /// Failures where re-running the whole unit of work may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::SerializationFailure(_)
                | DbError::Deadlock(_)
                | DbError::LockNotAvailable(_)
                | DbError::QueryCanceled(_)
                | DbError::Connection { .. }
        )
    }

    /// SQLSTATE of the failure, if it came from (or mirrors) a server error.
    pub fn code(&self) -> Option<&str> {
        match self {
            DbError::NotFound | DbError::Connection { .. } => None,
            DbError::UniqueViolation { .. } => Some(sqlstate::UNIQUE_VIOLATION),
            DbError::ForeignKeyViolation { .. } => Some(sqlstate::FOREIGN_KEY_VIOLATION),
            DbError::CheckViolation { .. } => Some(sqlstate::CHECK_VIOLATION),
            DbError::SerializationFailure(_) => Some(sqlstate::SERIALIZATION_FAILURE),
            DbError::Deadlock(_) => Some(sqlstate::DEADLOCK_DETECTED),
            DbError::LockNotAvailable(_) => Some(sqlstate::LOCK_NOT_AVAILABLE),
            DbError::QueryCanceled(_) => Some(sqlstate::QUERY_CANCELED),
            DbError::Other { code, .. } => code.as_deref(),
        }
    }

    pub fn unique(constraint: &str, message: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            constraint: constraint.to_string(),
            message: message.into(),
        }
    }

    pub fn foreign_key(constraint: &str, message: impl Into<String>) -> Self {
        DbError::ForeignKeyViolation {
            constraint: constraint.to_string(),
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        DbError::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn other(code: Option<&str>, message: impl Into<String>) -> Self {
        DbError::Other {
            code: code.map(str::to_string),
            message: message.into(),
            source: None,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => return DbError::NotFound,
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => {
                return DbError::Connection {
                    message: e.to_string(),
                    source: Some(e),
                };
            }
            _ => {}
        }

        let Some(db_err) = e.as_database_error() else {
            return DbError::Other {
                code: None,
                message: e.to_string(),
                source: Some(e),
            };
        };
        let code = db_err.code().map(|c| c.into_owned());
        let constraint = db_err.constraint().unwrap_or_default().to_string();
        let message = db_err.message().to_string();

        match code.as_deref() {
            Some(sqlstate::UNIQUE_VIOLATION) => DbError::UniqueViolation {
                constraint,
                message,
            },
            Some(sqlstate::FOREIGN_KEY_VIOLATION) => DbError::ForeignKeyViolation {
                constraint,
                message,
            },
            Some(sqlstate::CHECK_VIOLATION) => DbError::CheckViolation {
                constraint,
                message,
            },
            Some(sqlstate::SERIALIZATION_FAILURE) => DbError::SerializationFailure(message),
            Some(sqlstate::DEADLOCK_DETECTED) => DbError::Deadlock(message),
            Some(sqlstate::LOCK_NOT_AVAILABLE) => DbError::LockNotAvailable(message),
            Some(sqlstate::QUERY_CANCELED) => DbError::QueryCanceled(message),
            _ => DbError::Other {
                code: code.clone(),
                message,
                source: Some(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        assert!(matches!(
            DbError::from(sqlx::Error::RowNotFound),
            DbError::NotFound
        ));
    }

    #[test]
    fn test_pool_errors_are_transient() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.is_transient());
        assert!(!err.is_constraint_violation());
    }

    #[test]
    fn test_io_error_stays_reachable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DbError::from(sqlx::Error::Io(io));

        assert!(err.is_transient());
        let source = err.source().expect("sqlx error kept as source");
        let sqlx_err = source
            .downcast_ref::<sqlx::Error>()
            .expect("source is the sqlx error");
        assert!(matches!(sqlx_err, sqlx::Error::Io(_)));
        assert!(err.to_string().contains("reset by peer"));
    }

    #[test]
    fn test_unclassified_error_keeps_source() {
        let err = DbError::from(sqlx::Error::Protocol("unexpected message".to_string()));

        assert!(matches!(err, DbError::Other { code: None, .. }));
        assert!(!err.is_transient());
        assert!(err.source().is_some());
    }

    #[test]
    fn test_classification() {
        assert!(DbError::unique("users_pkey", "dup").is_constraint_violation());
        assert!(DbError::foreign_key("entries_account_id_fkey", "missing").is_constraint_violation());
        assert!(DbError::Deadlock("x".into()).is_transient());
        assert!(DbError::SerializationFailure("x".into()).is_transient());
        assert!(!DbError::NotFound.is_transient());
        assert!(!DbError::other(None, "x").is_transient());
    }

    #[test]
    fn test_sqlstate_codes() {
        assert_eq!(DbError::unique("users_pkey", "dup").code(), Some("23505"));
        assert_eq!(DbError::Deadlock("x".into()).code(), Some("40P01"));
        assert_eq!(
            DbError::other(Some(sqlstate::NUMERIC_VALUE_OUT_OF_RANGE), "bigint out of range").code(),
            Some("22003")
        );
        assert_eq!(DbError::connection("gone").code(), None);
        assert_eq!(DbError::NotFound.code(), None);
    }

    #[test]
    fn test_display() {
        let err = DbError::unique("users_pkey", "duplicate key value");
        assert_eq!(
            err.to_string(),
            "unique violation on users_pkey: duplicate key value"
        );
    }
}
