/*!
 * Error types for Bulwark
 */

use bulwark_core_resilience::ResilienceError;
use bulwark_db::DbError;
use bulwark_server::ServerError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BulwarkError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_RUNTIME: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Error)]
pub enum BulwarkError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Logging could not be initialized
    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl BulwarkError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BulwarkError::Config(_)
            | BulwarkError::ConfigRead { .. }
            | BulwarkError::ConfigParse { .. }
            | BulwarkError::Logging(_) => EXIT_CONFIG,
            BulwarkError::Database(_) | BulwarkError::Server(_) | BulwarkError::Resilience(_) => {
                EXIT_RUNTIME
            }
        }
    }
}
