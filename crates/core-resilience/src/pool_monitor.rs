//! Connection pool monitor
//!
//! Tracks every registered pool and gates new work against a global connection
//! ceiling. The ceiling represents the database's `max_connections` minus a
//! reserve for administrative sessions, so the sum of all pools must stay below it.
//!
//! Pools are registered through the [`MonitoredPool`] trait; stats are computed on
//! demand from the live pools rather than stored.
//!
//! # Example
//!
//! ```
//! use bulwark_core_resilience::pool_monitor::{MonitoredPool, PoolMonitor, PoolMonitorConfig, PoolStats};
//! use std::sync::Arc;
//!
//! struct Fixed(PoolStats);
//!
//! impl MonitoredPool for Fixed {
//!     fn snapshot(&self) -> PoolStats {
//!         self.0.clone()
//!     }
//! }
//!
//! let monitor = PoolMonitor::new(PoolMonitorConfig {
//!     max_total_connections: 10,
//!     ..Default::default()
//! });
//! monitor.register_pool("primary", Arc::new(Fixed(PoolStats::new(9, 0, 0, 20))));
//!
//! let decision = monitor.check_connection_limit();
//! assert!(!decision.allowed);
//! ```

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Something the monitor can take a utilization snapshot of
pub trait MonitoredPool: Send + Sync {
    /// Current connection counts
    fn snapshot(&self) -> PoolStats;

    /// Close up to `count` idle connections, returning how many were closed
    ///
    /// Pools that cannot shrink on demand keep the default.
    fn close_idle(&self, _count: usize) -> usize {
        0
    }
}

/// Point-in-time statistics for one pool
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Open connections, idle and in use
    pub total: usize,
    /// Open connections not currently borrowed
    pub idle: usize,
    /// Callers waiting for a connection
    pub waiting: usize,
    /// Configured pool maximum
    pub max: usize,
    /// `total / max`, in `0.0..=1.0` for a well-behaved pool
    pub utilization: f64,
}

impl PoolStats {
    pub fn new(total: usize, idle: usize, waiting: usize, max: usize) -> Self {
        let utilization = if max == 0 {
            0.0
        } else {
            total as f64 / max as f64
        };

        Self {
            total,
            idle,
            waiting,
            max,
            utilization,
        }
    }

    /// Connections currently borrowed
    pub fn active(&self) -> usize {
        self.total.saturating_sub(self.idle)
    }
}

/// Ceiling and thresholds for admission control
#[derive(Debug, Clone)]
pub struct PoolMonitorConfig {
    /// Connections all pools together may hold
    pub max_total_connections: usize,
    /// Utilization at which admissions are logged as a warning
    pub warning_threshold: f64,
    /// Utilization at which admissions are refused
    pub critical_threshold: f64,
}

impl Default for PoolMonitorConfig {
    fn default() -> Self {
        Self {
            max_total_connections: 80,
            warning_threshold: 0.8,
            critical_threshold: 0.9,
        }
    }
}

/// Outcome of [`PoolMonitor::check_connection_limit`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Aggregate utilization against the global ceiling
    pub utilization: f64,
    pub total_connections: usize,
    pub stats: BTreeMap<String, PoolStats>,
}

/// Registry of pools with global admission control
pub struct PoolMonitor {
    config: PoolMonitorConfig,
    pools: RwLock<BTreeMap<String, Arc<dyn MonitoredPool>>>,
}

impl fmt::Debug for PoolMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .pools
            .read()
            .map(|pools| pools.keys().cloned().collect())
            .unwrap_or_default();

        f.debug_struct("PoolMonitor")
            .field("config", &self.config)
            .field("pools", &names)
            .finish()
    }
}

impl Default for PoolMonitor {
    fn default() -> Self {
        Self::new(PoolMonitorConfig::default())
    }
}

impl PoolMonitor {
    pub fn new(config: PoolMonitorConfig) -> Self {
        Self {
            config,
            pools: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &PoolMonitorConfig {
        &self.config
    }

    /// Register a pool under `name`, replacing any previous registration
    pub fn register_pool(&self, name: impl Into<String>, pool: Arc<dyn MonitoredPool>) {
        let name = name.into();
        let replaced = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), pool)
            .is_some();
        info!(pool = %name, replaced, "Registered connection pool");
    }

    /// Remove a registration; returns false if the name was unknown
    pub fn unregister_pool(&self, name: &str) -> bool {
        let removed = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            info!(pool = %name, "Unregistered connection pool");
        }
        removed
    }

    /// Remove `name` only while it still refers to `pool`
    ///
    /// Lets an owner that has been replaced under the same name leave without
    /// dropping its successor's registration.
    pub fn unregister_pool_if(&self, name: &str, pool: &Arc<dyn MonitoredPool>) -> bool {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let owned = pools
            .get(name)
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(pool)));
        if owned {
            pools.remove(name);
            info!(pool = %name, "Unregistered connection pool");
        } else {
            debug!(pool = %name, "Registration belongs to another owner, left in place");
        }
        owned
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Per-pool statistics, keyed by registration name
    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, pool)| (name.clone(), pool.snapshot()))
            .collect()
    }

    /// Decide whether new connection-consuming work may start
    pub fn check_connection_limit(&self) -> AdmissionDecision {
        let stats = self.stats();
        let total_connections: usize = stats.values().map(|s| s.total).sum();
        let utilization = if self.config.max_total_connections == 0 {
            1.0
        } else {
            total_connections as f64 / self.config.max_total_connections as f64
        };

        if utilization >= self.config.critical_threshold {
            let reason = format!(
                "Connection usage at {:.0}% of ceiling ({}/{})",
                utilization * 100.0,
                total_connections,
                self.config.max_total_connections
            );
            warn!(
                total_connections,
                ceiling = self.config.max_total_connections,
                utilization,
                "Refusing work: connection ceiling nearly exhausted"
            );
            return AdmissionDecision {
                allowed: false,
                reason: Some(reason),
                utilization,
                total_connections,
                stats,
            };
        }

        if utilization >= self.config.warning_threshold {
            warn!(
                total_connections,
                ceiling = self.config.max_total_connections,
                utilization,
                "Connection usage above warning threshold"
            );
        }

        AdmissionDecision {
            allowed: true,
            reason: None,
            utilization,
            total_connections,
            stats,
        }
    }

    /// Best-effort shrink of a pool toward `target` open connections
    ///
    /// Only idle connections are closed, so the pool may stay above the target.
    /// Returns the number of connections closed.
    pub fn reduce_pool_size(&self, name: &str, target: usize) -> usize {
        let pool = {
            let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
            match pools.get(name) {
                Some(pool) => Arc::clone(pool),
                None => {
                    debug!(pool = %name, "reduce_pool_size on unknown pool");
                    return 0;
                }
            }
        };

        let stats = pool.snapshot();
        let excess = stats.total.saturating_sub(target);
        let closable = excess.min(stats.idle);
        if closable == 0 {
            return 0;
        }

        let closed = pool.close_idle(closable);
        info!(pool = %name, target, requested = closable, closed, "Reduced pool size");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakePool {
        stats: Mutex<PoolStats>,
        shrinkable: bool,
    }

    impl FakePool {
        fn new(total: usize, idle: usize, max: usize) -> Arc<Self> {
            Arc::new(Self {
                stats: Mutex::new(PoolStats::new(total, idle, 0, max)),
                shrinkable: true,
            })
        }

        fn rigid(total: usize, idle: usize, max: usize) -> Arc<Self> {
            Arc::new(Self {
                stats: Mutex::new(PoolStats::new(total, idle, 0, max)),
                shrinkable: false,
            })
        }
    }

    impl MonitoredPool for FakePool {
        fn snapshot(&self) -> PoolStats {
            self.stats.lock().unwrap().clone()
        }

        fn close_idle(&self, count: usize) -> usize {
            if !self.shrinkable {
                return 0;
            }
            let mut stats = self.stats.lock().unwrap();
            let closed = count.min(stats.idle);
            *stats = PoolStats::new(stats.total - closed, stats.idle - closed, stats.waiting, stats.max);
            closed
        }
    }

    fn monitor(ceiling: usize) -> PoolMonitor {
        PoolMonitor::new(PoolMonitorConfig {
            max_total_connections: ceiling,
            ..Default::default()
        })
    }

    #[test]
    fn test_pool_stats_utilization() {
        let stats = PoolStats::new(5, 2, 1, 10);
        assert!((stats.utilization - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.active(), 3);
        assert_eq!(PoolStats::new(0, 0, 0, 0).utilization, 0.0);
    }

    #[test]
    fn test_empty_monitor_admits() {
        let decision = PoolMonitor::default().check_connection_limit();
        assert!(decision.allowed);
        assert!(decision.reason.is_none());
        assert_eq!(decision.total_connections, 0);
    }

    #[test]
    fn test_below_warning_admits() {
        let monitor = monitor(100);
        monitor.register_pool("a", FakePool::new(30, 10, 50));
        monitor.register_pool("b", FakePool::new(20, 0, 50));

        let decision = monitor.check_connection_limit();
        assert!(decision.allowed);
        assert_eq!(decision.total_connections, 50);
        assert_eq!(decision.stats.len(), 2);
    }

    #[test]
    fn test_warning_band_admits() {
        let monitor = monitor(100);
        monitor.register_pool("a", FakePool::new(85, 0, 100));

        let decision = monitor.check_connection_limit();
        assert!(decision.allowed);
        assert!((decision.utilization - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_critical_sums_all_pools() {
        let monitor = monitor(100);
        monitor.register_pool("a", FakePool::new(50, 0, 60));
        monitor.register_pool("b", FakePool::new(40, 0, 60));

        let decision = monitor.check_connection_limit();
        assert!(!decision.allowed);
        let reason = decision.reason.unwrap();
        assert!(reason.contains("90/100"), "{reason}");
    }

    #[test]
    fn test_unregister() {
        let monitor = monitor(10);
        monitor.register_pool("a", FakePool::new(10, 0, 10));
        assert!(!monitor.check_connection_limit().allowed);

        assert!(monitor.unregister_pool("a"));
        assert!(!monitor.unregister_pool("a"));
        assert!(!monitor.is_registered("a"));
        assert!(monitor.check_connection_limit().allowed);
    }

    #[test]
    fn test_unregister_if_keeps_successor() {
        let monitor = monitor(100);
        let first: Arc<dyn MonitoredPool> = FakePool::new(10, 0, 10);
        let second: Arc<dyn MonitoredPool> = FakePool::new(4, 0, 10);

        monitor.register_pool("primary", Arc::clone(&first));
        monitor.register_pool("primary", Arc::clone(&second));

        assert!(!monitor.unregister_pool_if("primary", &first));
        assert_eq!(monitor.check_connection_limit().total_connections, 4);

        assert!(monitor.unregister_pool_if("primary", &second));
        assert!(!monitor.is_registered("primary"));
    }

    #[test]
    fn test_reduce_pool_size_closes_idle_only() {
        let monitor = monitor(100);
        let pool = FakePool::new(10, 3, 20);
        monitor.register_pool("a", pool.clone());

        // Wants 8 closed, only 3 are idle
        assert_eq!(monitor.reduce_pool_size("a", 2), 3);
        assert_eq!(pool.snapshot().total, 7);

        assert_eq!(monitor.reduce_pool_size("a", 10), 0);
        assert_eq!(monitor.reduce_pool_size("missing", 0), 0);
    }

    #[test]
    fn test_reduce_pool_size_on_rigid_pool() {
        let monitor = monitor(100);
        monitor.register_pool("a", FakePool::rigid(10, 5, 20));
        assert_eq!(monitor.reduce_pool_size("a", 0), 0);
    }
}
