//! Error types for the engine adapters.

use thiserror::Error;

/// Engine operation result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors with retry classification.
///
/// - `Transient`: the same operation may succeed on a fresh attempt
///   (connection reset, lock/busy, deadlock, serialization failure).
/// - `Fatal`: retrying will not help (auth rejected, malformed DSN, syntax or
///   constraint violation, backend not compiled in).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Transient engine error (retry eligible): {message}")]
    Transient { message: String },

    #[error("Fatal engine error: {message}")]
    Fatal { message: String },
}

impl EngineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Check if this error is transient (eligible for retry)
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient { .. })
    }

    /// Check if this error is fatal (no retry)
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            EngineError::Transient { message } | EngineError::Fatal { message } => message,
        }
    }

    /// Engine for a DSN whose backend feature was not enabled at build time.
    pub fn not_compiled(engine: &str, feature: &str) -> Self {
        Self::fatal(format!(
            "Engine {} not compiled in. Rebuild with the '{}' feature.",
            engine, feature
        ))
    }
}

/// Classify an sqlx error.
///
/// Backend-specific database errors are handed to `classify_db` so each
/// adapter can apply its own SQLSTATE / error-number rules.
#[cfg(any(feature = "sqlite", feature = "postgres", feature = "mysql"))]
pub(crate) fn classify_sqlx(
    err: sqlx::Error,
    classify_db: fn(&(dyn sqlx::error::DatabaseError + 'static)) -> bool,
) -> EngineError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => EngineError::transient(err.to_string()),
        sqlx::Error::Database(db_err) => {
            if classify_db(db_err.as_ref()) {
                EngineError::transient(err.to_string())
            } else {
                EngineError::fatal(err.to_string())
            }
        }
        _ => EngineError::fatal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        assert!(EngineError::transient("reset").is_transient());
        assert!(EngineError::fatal("auth").is_fatal());
        assert_eq!(EngineError::fatal("auth").message(), "auth");
    }

    #[test]
    fn not_compiled_names_feature() {
        let err = EngineError::not_compiled("DB2", "db2");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("'db2'"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = classify_sqlx(sqlx::Error::Io(io), |_| false);
        assert!(err.is_transient());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn row_not_found_is_fatal() {
        let err = classify_sqlx(sqlx::Error::RowNotFound, |_| true);
        assert!(err.is_fatal());
    }
}
