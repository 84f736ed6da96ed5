//! Error types for the resilience primitives

use crate::circuit_breaker::CircuitOpenError;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the resilience primitives themselves
#[derive(Debug, Error, Clone)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Options passed to a primitive were unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal bookkeeping could not be accessed
    #[error("Internal state error: {0}")]
    Internal(String),
}

/// Failure of a guarded initialization.
///
/// Cloneable so every caller joined on the same in-flight initialization
/// receives the same outcome.
#[derive(Debug, Error, Clone)]
pub enum InitError {
    /// Admission was refused before the initialization started
    #[error("Initialization refused: {reason}")]
    Capacity { reason: String },

    /// The initialization ran and failed
    #[error("Initialization failed: {0}")]
    Failed(#[source] Arc<dyn StdError + Send + Sync>),
}

impl InitError {
    /// Wrap the error produced by a failed initialization
    pub fn failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        InitError::Failed(Arc::new(error))
    }
}
