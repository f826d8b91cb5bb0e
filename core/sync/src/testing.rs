//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use offgrid_common::{Error, Result};
use offgrid_storage::{CacheGeneration, CachedResponse, MemoryStore, ResourceStore, StoreKey};

use crate::deliver::Deliverer;
use crate::queue::QueueItem;

pub fn runtime() -> CacheGeneration {
    CacheGeneration::new("mfb", "runtime", "v3").unwrap()
}

/// Memory store whose reads and writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("injected {} failure", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<CachedResponse>> {
        self.check(&self.fail_reads, "read")?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &StoreKey, response: CachedResponse) -> Result<()> {
        self.check(&self.fail_writes, "write")?;
        self.inner.put(key, response).await
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool> {
        self.check(&self.fail_writes, "delete")?;
        self.inner.delete(key).await
    }

    async fn keys(&self) -> Result<Vec<StoreKey>> {
        self.check(&self.fail_reads, "list")?;
        self.inner.keys().await
    }
}

/// Deliverer that fails its first `failures` calls.
pub struct ScriptedDeliverer {
    failures: usize,
    latency: Duration,
    calls: AtomicUsize,
}

impl ScriptedDeliverer {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn always_succeeding() -> Self {
        Self::failing_first(0)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Deliverer for ScriptedDeliverer {
    async fn deliver(&self, item: &QueueItem) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if call < self.failures {
            return Err(Error::Delivery(format!("scripted failure for {}", item.id)));
        }
        Ok(())
    }
}

/// Deliverer that parks every call until released.
#[derive(Default)]
pub struct BlockingDeliverer {
    started: Notify,
    gate: Notify,
}

impl BlockingDeliverer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Deliverer for BlockingDeliverer {
    async fn deliver(&self, _item: &QueueItem) -> Result<()> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(())
    }
}
