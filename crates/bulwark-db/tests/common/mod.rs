//! In-memory pool and client doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bulwark_core_resilience::{MonitoredPool, PoolStats};
use bulwark_db::{ClientFactory, DatabasePool, DbError, PoolFactory};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Failure injected into the next query
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Refused,
    PoolTimeout,
    Syntax,
}

impl Fault {
    pub fn to_error(self) -> DbError {
        match self {
            Fault::Refused => refused(),
            Fault::PoolTimeout => DbError::PoolTimeout(Duration::from_secs(5)),
            Fault::Syntax => DbError::Database {
                code: "42601".to_string(),
                message: "syntax error at or near \"SELEC\"".to_string(),
            },
        }
    }
}

pub fn refused() -> DbError {
    DbError::Connection(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

/// Simulated database server shared by every pool built from one factory
#[derive(Default)]
pub struct Backend {
    down: AtomicBool,
    pub created: AtomicUsize,
    pub queries: AtomicUsize,
    pub pings: AtomicUsize,
    faults: Mutex<VecDeque<Fault>>,
}

impl Backend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    pub fn inject(&self, fault: Fault, times: usize) {
        let mut faults = self.faults.lock().unwrap();
        for _ in 0..times {
            faults.push_back(fault);
        }
    }

    fn next_fault(&self) -> Option<Fault> {
        self.faults.lock().unwrap().pop_front()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

pub struct FakePool {
    pub id: usize,
    backend: Arc<Backend>,
    closed: AtomicBool,
}

impl MonitoredPool for FakePool {
    fn snapshot(&self) -> PoolStats {
        PoolStats::new(2, 1, 0, 5)
    }
}

#[async_trait]
impl DatabasePool for FakePool {
    type Connection = usize;
    type Row = String;

    async fn acquire(&self) -> Result<usize, DbError> {
        if self.backend.is_down() {
            return Err(refused());
        }
        Ok(self.id)
    }

    async fn query(&self, sql: &str) -> Result<Vec<String>, DbError> {
        self.backend.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.backend.next_fault() {
            return Err(fault.to_error());
        }
        if self.backend.is_down() {
            return Err(refused());
        }
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        Ok(vec![format!("{}:{}", self.id, sql)])
    }

    async fn ping(&self) -> Result<(), DbError> {
        self.backend.pings.fetch_add(1, Ordering::SeqCst);
        if self.backend.is_down() {
            return Err(refused());
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakePoolFactory {
    pub backend: Arc<Backend>,
}

#[async_trait]
impl PoolFactory<FakePool> for FakePoolFactory {
    async fn create(&self) -> Result<FakePool, DbError> {
        if self.backend.is_down() {
            return Err(refused());
        }
        let id = self.backend.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakePool {
            id,
            backend: Arc::clone(&self.backend),
            closed: AtomicBool::new(false),
        })
    }
}

/// Opaque client handle produced by [`FakeClientFactory`]
#[derive(Debug, Clone)]
pub struct FakeClient {
    pub id: usize,
}

/// Client factory with a slow build, counting invocations
#[derive(Default)]
pub struct FakeClientFactory {
    pub builds: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl ClientFactory<FakeClient> for FakeClientFactory {
    async fn build(&self) -> Result<FakeClient, DbError> {
        let id = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(200)).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(refused());
        }
        Ok(FakeClient { id })
    }
}
