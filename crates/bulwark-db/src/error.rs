//! Database error type and recovery decisions

use bulwark_core_resilience::error_classifier::{ErrorReport, POOL_TIMEOUT_CODE};
use bulwark_core_resilience::ResilienceError;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by caller-supplied operations
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that warrant tearing the pool down and building a new one
const RECONNECT_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    // admin_shutdown, crash_shutdown, cannot_connect_now
    "57P01",
    "57P02",
    "57P03",
    // connection_exception class
    "08000",
    "08001",
    "08003",
    "08004",
    "08006",
];

const RECONNECT_MESSAGES: &[&str] = &[
    "connection terminated",
    "timeout expired",
    "server closed the connection",
];

/// Errors raised by the connection manager and database pools
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    #[error("Database error [{code}]: {message}")]
    Database { code: String, message: String },

    #[error("Connection error: {0}")]
    Connection(#[source] io::Error),

    #[error("Database connection lost, reconnect abandoned after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Operation failed: {0}")]
    Operation(#[source] BoxError),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

/// What the manager should do after an operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Surface the error
    Fail,
    /// Back off and try again on the same pool
    Retry,
    /// Back off, try again, and rebuild the pool in the background
    RetryAndReconnect,
}

impl DbError {
    /// Wrap an arbitrary operation error
    pub fn operation<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        DbError::Operation(Box::new(error))
    }

    /// Describe this error for the classifier
    pub fn report(&self) -> ErrorReport {
        match self {
            DbError::Sqlx(err) => report_sqlx(err),
            DbError::PoolClosed => ErrorReport::new("PoolClosed", self.to_string()),
            DbError::PoolTimeout(_) => {
                ErrorReport::new("PoolTimedOut", self.to_string()).with_code(POOL_TIMEOUT_CODE)
            }
            DbError::Database { code, message } => {
                ErrorReport::new("DatabaseError", message.clone()).with_code(code.clone())
            }
            DbError::Operation(err) => report_dyn(err.as_ref()),
            DbError::Connection(_) | DbError::ReconnectExhausted(_) | DbError::Resilience(_) => {
                ErrorReport::from_error(self)
            }
        }
    }

    /// Decide how the manager recovers from this error
    pub fn recovery_action(&self) -> RecoveryAction {
        if matches!(self, DbError::ReconnectExhausted(_) | DbError::Resilience(_)) {
            return RecoveryAction::Fail;
        }

        let report = self.report();
        if report.is_pool_timeout() {
            return RecoveryAction::Retry;
        }

        let code_matches = report
            .code
            .as_deref()
            .is_some_and(|code| RECONNECT_CODES.contains(&code));
        let lowered = report.message.to_lowercase();
        let message_matches = RECONNECT_MESSAGES.iter().any(|m| lowered.contains(m));

        if code_matches || message_matches || matches!(self, DbError::PoolClosed) {
            RecoveryAction::RetryAndReconnect
        } else {
            RecoveryAction::Fail
        }
    }
}

/// Describe a sqlx error for the classifier
pub fn report_sqlx(err: &sqlx::Error) -> ErrorReport {
    match err {
        sqlx::Error::PoolTimedOut => {
            ErrorReport::new("PoolTimedOut", err.to_string()).with_code(POOL_TIMEOUT_CODE)
        }
        sqlx::Error::PoolClosed => ErrorReport::new("PoolClosed", err.to_string()),
        sqlx::Error::Database(db) => {
            let report = ErrorReport::new("DatabaseError", db.message());
            match db.code() {
                Some(code) => report.with_code(code.into_owned()),
                None => report,
            }
        }
        _ => ErrorReport::from_error(err),
    }
}

/// Describe any error, recognising database errors anywhere in the chain
pub fn report_dyn(err: &(dyn StdError + 'static)) -> ErrorReport {
    let mut current = Some(err);
    while let Some(cause) = current {
        if let Some(db) = cause.downcast_ref::<DbError>() {
            return db.report();
        }
        if let Some(sqlx_err) = cause.downcast_ref::<sqlx::Error>() {
            return report_sqlx(sqlx_err);
        }
        current = cause.source();
    }
    ErrorReport::from_error(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_connection_triggers_reconnect() {
        let err = DbError::Connection(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(err.report().code.as_deref(), Some("ECONNREFUSED"));
        assert_eq!(err.recovery_action(), RecoveryAction::RetryAndReconnect);
    }

    #[test]
    fn test_admin_shutdown_triggers_reconnect() {
        let err = DbError::Database {
            code: "57P01".to_string(),
            message: "terminating connection due to administrator command".to_string(),
        };
        assert_eq!(err.recovery_action(), RecoveryAction::RetryAndReconnect);
    }

    #[test]
    fn test_terminated_message_triggers_reconnect() {
        let err = DbError::operation(io::Error::other("Connection terminated unexpectedly"));
        assert_eq!(err.recovery_action(), RecoveryAction::RetryAndReconnect);
    }

    #[test]
    fn test_pool_timeout_retries_without_reconnect() {
        assert_eq!(
            DbError::Sqlx(sqlx::Error::PoolTimedOut).recovery_action(),
            RecoveryAction::Retry
        );
        assert_eq!(
            DbError::PoolTimeout(Duration::from_secs(5)).recovery_action(),
            RecoveryAction::Retry
        );
    }

    #[test]
    fn test_query_errors_fail() {
        let err = DbError::Database {
            code: "42P01".to_string(),
            message: "relation \"pages\" does not exist".to_string(),
        };
        assert_eq!(err.recovery_action(), RecoveryAction::Fail);
        assert_eq!(DbError::ReconnectExhausted(10).recovery_action(), RecoveryAction::Fail);
    }

    #[test]
    fn test_report_dyn_finds_wrapped_db_error() {
        #[derive(Debug, Error)]
        #[error("loading page failed")]
        struct LoadError(#[source] DbError);

        let err = LoadError(DbError::Database {
            code: "53300".to_string(),
            message: "sorry, too many clients already".to_string(),
        });
        let report = report_dyn(&err);
        assert_eq!(report.code.as_deref(), Some("53300"));
        assert!(report.is_capacity_exhausted());
    }
}
