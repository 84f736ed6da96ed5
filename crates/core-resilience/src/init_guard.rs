//! Single-flight guard for expensive initialization
//!
//! Concurrent callers of [`InitGuard::run`] join the initialization already in
//! flight instead of starting their own, and all of them receive the same result.
//! Once it settles the slot is cleared, so a later call (for example after the
//! client was invalidated) starts a fresh initialization.
//!
//! Before starting a new initialization the guard asks the [`PoolMonitor`], when
//! one is attached, whether the global connection ceiling allows it.

use crate::error::InitError;
use crate::pool_monitor::PoolMonitor;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::error::Error as StdError;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

type InFlight<T> = Shared<BoxFuture<'static, Result<T, InitError>>>;

/// Runs at most one initialization at a time and shares its outcome
pub struct InitGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    monitor: Option<Arc<PoolMonitor>>,
    in_flight: Mutex<Option<InFlight<T>>>,
}

impl<T> std::fmt::Debug for InitGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitGuard")
            .field("has_monitor", &self.monitor.is_some())
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

impl<T> Default for InitGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InitGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Guard without admission control
    pub fn new() -> Self {
        Self {
            monitor: None,
            in_flight: Mutex::new(None),
        }
    }

    /// Guard that refuses to start when the pool monitor denies admission
    pub fn with_monitor(monitor: Arc<PoolMonitor>) -> Self {
        Self {
            monitor: Some(monitor),
            in_flight: Mutex::new(None),
        }
    }

    /// True while an initialization is running
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Run `init`, or join the run already in progress
    ///
    /// `init` is only invoked when no other initialization is in flight.
    pub async fn run<F, Fut, E>(&self, init: F) -> Result<T, InitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let shared = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight initialization");
                    existing.clone()
                }
                None => {
                    if let Some(monitor) = &self.monitor {
                        let decision = monitor.check_connection_limit();
                        if !decision.allowed {
                            let reason = decision
                                .reason
                                .unwrap_or_else(|| "connection ceiling reached".to_string());
                            warn!(%reason, "Initialization refused by pool monitor");
                            return Err(InitError::Capacity { reason });
                        }
                    }

                    let future = init()
                        .map(|result| result.map_err(InitError::failed))
                        .boxed()
                        .shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };

        let result = shared.clone().await;

        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|current| Shared::ptr_eq(current, &shared))
        {
            *slot = None;
        }

        result
    }
}
