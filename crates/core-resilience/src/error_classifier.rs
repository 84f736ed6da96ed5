//! Error classification and log throttling
//!
//! Every failure that reaches the resilience layer is reduced to an [`ErrorReport`]
//! and run through [`ErrorClassifier::handle_error`], which decides whether the
//! caller may retry and whether the failure is worth logging.
//!
//! Checks run in a fixed order:
//! 1. client aborts
//! 2. per-signature throttling
//! 3. connection-slot exhaustion
//! 4. other database errors
//! 5. transient network errors
//! 6. everything else
//!
//! Capacity exhaustion is checked before the network patterns because the server's
//! "too many clients" messages also mention connections and would otherwise be
//! retried, which only deepens the contention.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

/// Code attached to reports for local pool acquire timeouts
pub const POOL_TIMEOUT_CODE: &str = "EPOOLTIMEOUT";

/// Postgres SQLSTATE for `too_many_connections`
pub const SQLSTATE_TOO_MANY_CONNECTIONS: &str = "53300";

const ABORT_CODES: &[&str] = &["ECONNABORTED", "ABORT_ERR"];
const ABORT_MESSAGES: &[&str] = &[
    "request aborted",
    "client aborted",
    "operation was aborted",
    "operation was cancelled",
    "client disconnected",
];

const CAPACITY_MESSAGES: &[&str] = &[
    "remaining connection slots",
    "too many clients",
    "too many connections",
    "connection slots are reserved",
];

const NETWORK_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
    "EHOSTUNREACH",
    "ENETUNREACH",
    POOL_TIMEOUT_CODE,
];
const NETWORK_MESSAGES: &[&str] = &[
    "connection refused",
    "connection reset",
    "timed out",
    "timeout",
    "getaddrinfo",
    "network is unreachable",
    "broken pipe",
];

const DATABASE_MESSAGES: &[&str] = &[
    "database",
    "connection",
    "query",
    "relation",
    "postgres",
    "sql",
    "syntax error",
    "constraint",
    "deadlock",
    "transaction",
];

/// Category assigned to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The remote peer cancelled the request
    ClientAbort,
    /// Identical errors are arriving too fast to be worth handling individually
    Throttled,
    /// The database refused a connection because all slots are taken
    CapacityExhausted,
    /// Any other database-side failure
    Database,
    /// Connection refused/reset, timeouts, DNS failures
    NetworkTransient,
    /// Unrecognised failure
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ClientAbort => "client_abort",
            ErrorCategory::Throttled => "throttled",
            ErrorCategory::CapacityExhausted => "capacity_exhausted",
            ErrorCategory::Database => "database",
            ErrorCategory::NetworkTransient => "network_transient",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Language-neutral description of a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Short type-like name, e.g. `IoError` or `DatabaseError`
    pub name: String,
    /// POSIX-style errno name or SQLSTATE, when known
    pub code: Option<String>,
    pub message: String,
}

impl ErrorReport {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Build a report from any error by walking its source chain
    ///
    /// The first I/O error found in the chain contributes its kind as the code.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut message = err.to_string();
        let mut name = "Error";
        let mut code = None;

        let mut current = Some(err);
        let mut depth = 0usize;
        while let Some(cause) = current {
            if code.is_none() {
                if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                    name = "IoError";
                    code = io_kind_code(io_err.kind()).map(str::to_string);
                }
            }

            if depth > 0 {
                let text = cause.to_string();
                if !message.contains(&text) {
                    message.push_str(": ");
                    message.push_str(&text);
                }
            }
            depth += 1;
            current = cause.source();
        }

        Self {
            name: name.to_string(),
            code,
            message,
        }
    }

    fn code_is(&self, candidates: &[&str]) -> bool {
        self.code
            .as_deref()
            .is_some_and(|code| candidates.iter().any(|c| c.eq_ignore_ascii_case(code)))
    }

    /// True when the code looks like a five-character SQLSTATE
    pub fn has_sqlstate(&self) -> bool {
        self.code.as_deref().is_some_and(|code| {
            code.len() == 5
                && code
                    .chars()
                    .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        })
    }

    fn message_contains(&self, needles: &[&str]) -> bool {
        let lowered = self.message.to_lowercase();
        needles.iter().any(|needle| lowered.contains(needle))
    }

    fn signature(&self, length: usize) -> String {
        let prefix: String = self.message.chars().take(length).collect();
        format!("{}:{}", self.name, prefix)
    }

    pub fn is_client_abort(&self) -> bool {
        self.code_is(ABORT_CODES)
            || self.name == "AbortError"
            || self.message.trim().eq_ignore_ascii_case("aborted")
            || self.message_contains(ABORT_MESSAGES)
    }

    pub fn is_capacity_exhausted(&self) -> bool {
        self.code_is(&[SQLSTATE_TOO_MANY_CONNECTIONS]) || self.message_contains(CAPACITY_MESSAGES)
    }

    pub fn is_network_code(&self) -> bool {
        self.code_is(NETWORK_CODES)
    }

    pub fn is_pool_timeout(&self) -> bool {
        self.code_is(&[POOL_TIMEOUT_CODE])
    }

    /// Database-side errors: an SQLSTATE, or database vocabulary without a network code
    pub fn is_database_error(&self) -> bool {
        self.has_sqlstate() || (!self.is_network_code() && self.message_contains(DATABASE_MESSAGES))
    }

    pub fn is_network_transient(&self) -> bool {
        self.is_network_code() || self.message_contains(NETWORK_MESSAGES)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.name, code, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

fn io_kind_code(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
        io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
        io::ErrorKind::BrokenPipe => Some("EPIPE"),
        io::ErrorKind::NotConnected => Some("ENOTCONN"),
        io::ErrorKind::AddrNotAvailable => Some("EADDRNOTAVAIL"),
        _ => None,
    }
}

/// Decision returned for a classified failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorVerdict {
    /// The failure was fully absorbed; the caller can answer with a safe fallback
    pub handled: bool,
    pub category: ErrorCategory,
    /// Message safe to show to an end user
    pub message: String,
    pub should_retry: bool,
    pub should_log: bool,
}

impl ErrorVerdict {
    fn new(category: ErrorCategory) -> Self {
        let (handled, message, should_retry, should_log) = match category {
            ErrorCategory::ClientAbort => (true, "Request was cancelled by the client", false, false),
            ErrorCategory::Throttled => (true, "Service is busy, please try again shortly", false, false),
            ErrorCategory::CapacityExhausted => (
                false,
                "Database is at connection capacity, please retry later",
                false,
                true,
            ),
            ErrorCategory::Database => (false, "A database error occurred", false, true),
            ErrorCategory::NetworkTransient => {
                (false, "A temporary connection problem occurred", true, true)
            }
            ErrorCategory::Fatal => (false, "An unexpected error occurred", false, true),
        };

        Self {
            handled,
            category,
            message: message.to_string(),
            should_retry,
            should_log,
        }
    }
}

/// Throttling configuration for the classifier
#[derive(Debug, Clone)]
pub struct ErrorClassifierConfig {
    /// Identical errors allowed per monitoring window before throttling
    pub max_errors_per_minute: usize,
    /// Rolling window for signature counting
    pub monitoring_window: Duration,
    /// Message characters included in a signature
    pub signature_length: usize,
    /// Upper bound on distinct signatures held in memory
    pub max_signatures: usize,
}

impl Default for ErrorClassifierConfig {
    fn default() -> Self {
        Self {
            max_errors_per_minute: 10,
            monitoring_window: Duration::from_secs(60),
            signature_length: 100,
            max_signatures: 1_000,
        }
    }
}

/// Classifies failures and throttles repeated ones
#[derive(Debug, Default)]
pub struct ErrorClassifier {
    config: ErrorClassifierConfig,
    signatures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl ErrorClassifier {
    pub fn new(config: ErrorClassifierConfig) -> Self {
        Self {
            config,
            signatures: Mutex::new(HashMap::new()),
        }
    }

    /// Classify an error, logging it if the verdict says so
    pub fn handle_error(&self, report: &ErrorReport) -> ErrorVerdict {
        if report.is_client_abort() {
            return ErrorVerdict::new(ErrorCategory::ClientAbort);
        }

        if self.record_and_check_throttle(report) {
            return ErrorVerdict::new(ErrorCategory::Throttled);
        }

        let category = if report.is_capacity_exhausted() {
            ErrorCategory::CapacityExhausted
        } else if report.is_database_error() {
            ErrorCategory::Database
        } else if report.is_network_transient() {
            ErrorCategory::NetworkTransient
        } else {
            ErrorCategory::Fatal
        };

        let verdict = ErrorVerdict::new(category);
        if verdict.should_log {
            log_report(report, &verdict);
        }
        verdict
    }

    /// Convenience wrapper for errors that are not yet reports
    pub fn handle(&self, err: &(dyn StdError + 'static)) -> ErrorVerdict {
        self.handle_error(&ErrorReport::from_error(err))
    }

    /// Forget all recorded signatures
    pub fn reset(&self) {
        self.signatures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of distinct signatures currently tracked
    pub fn tracked_signatures(&self) -> usize {
        self.signatures
            .lock()
            .map(|signatures| signatures.len())
            .unwrap_or_default()
    }

    fn record_and_check_throttle(&self, report: &ErrorReport) -> bool {
        let now = Instant::now();
        let window = self.config.monitoring_window;
        let mut signatures = self.signatures.lock().unwrap_or_else(PoisonError::into_inner);

        let key = report.signature(self.config.signature_length);
        if !signatures.contains_key(&key) && signatures.len() >= self.config.max_signatures {
            signatures.retain(|_, seen| {
                seen.back()
                    .is_some_and(|last| now.duration_since(*last) <= window)
            });
            if signatures.len() >= self.config.max_signatures {
                // Still full of live signatures; classify without tracking.
                return false;
            }
        }

        let seen = signatures.entry(key).or_default();
        while seen
            .front()
            .is_some_and(|first| now.duration_since(*first) > window)
        {
            seen.pop_front();
        }

        if seen.len() >= self.config.max_errors_per_minute {
            return true;
        }
        seen.push_back(now);
        false
    }
}

fn log_report(report: &ErrorReport, verdict: &ErrorVerdict) {
    let code = report.code.as_deref().unwrap_or("-");
    match verdict.category {
        ErrorCategory::NetworkTransient => warn!(
            category = %verdict.category,
            name = %report.name,
            code,
            retry = verdict.should_retry,
            "{}",
            report.message
        ),
        _ => error!(
            category = %verdict.category,
            name = %report.name,
            code,
            retry = verdict.should_retry,
            "{}",
            report.message
        ),
    }
}
