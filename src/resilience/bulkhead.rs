//! # Resource Pool (Bulkhead)
//!
//! Bounded-concurrency permit issuer per resource class.
//!
//! A pool owns a fixed number of permits. `acquire` returns immediately while a
//! permit is free, otherwise the caller joins a FIFO queue and suspends until a
//! permit is handed to it or its timeout elapses. Released permits go straight
//! to the longest-waiting caller, so waiters are served strictly in arrival order
//! and a newcomer can never overtake a queued caller.
//!
//! Permits release themselves on drop. A permit handed to a waiter that gave up
//! in the meantime travels back through the same release path, so no permit is
//! ever lost and permits-in-use never exceed the capacity.

use crate::config::ResourcePoolSettings;
use crate::error::ErrorKind;
use crate::resilience::retry::Classify;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BulkheadError {
    #[error("Resource pool {pool} exhausted: no permit available within {timeout:?}")]
    ResourceExhausted { pool: String, timeout: Duration },

    #[error("Resource pool {pool} is closed")]
    Closed { pool: String },
}

impl Classify for BulkheadError {
    fn kind(&self) -> ErrorKind {
        // The caller may resubmit later; never retried inside the same call
        ErrorKind::System
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub total_acquired: u64,
    pub total_timeouts: u64,
}

struct Waiter {
    id: u64,
    sender: oneshot::Sender<ResourcePermit>,
}

struct PoolState {
    available: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    closed: bool,
    total_acquired: u64,
    total_timeouts: u64,
}

struct PoolInner {
    name: String,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Return a permit, handing it to the longest-waiting caller if any
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            let permit = ResourcePermit {
                pool: Some(self.clone()),
            };
            match waiter.sender.send(permit) {
                Ok(()) => {
                    state.total_acquired += 1;
                    debug!(pool = %self.name, waiter = waiter.id, "Permit handed to queued caller");
                    return;
                }
                Err(mut returned) => {
                    // Waiter already gave up; disarm so dropping doesn't re-enter release
                    returned.pool = None;
                }
            }
        }
        state.available = (state.available + 1).min(self.capacity);
    }
}

/// Exclusive permit for one unit of a pool's capacity.
///
/// Released by [`ResourcePermit::release`] or on drop.
pub struct ResourcePermit {
    pool: Option<Arc<PoolInner>>,
}

impl std::fmt::Debug for ResourcePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePermit")
            .field("pool", &self.pool.as_ref().map(|p| p.name.as_str()))
            .finish()
    }
}

impl ResourcePermit {
    pub fn pool_name(&self) -> &str {
        self.pool.as_ref().map(|p| p.name.as_str()).unwrap_or("")
    }

    /// Return the permit to its pool
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}

/// Fixed-capacity permit pool with FIFO waiters
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        let capacity = capacity.max(1);
        info!(pool = %name, capacity = capacity, "🚧 Resource pool initialized");

        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                state: Mutex::new(PoolState {
                    available: capacity,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                    closed: false,
                    total_acquired: 0,
                    total_timeouts: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Take a permit without waiting
    pub fn try_acquire(&self) -> Result<ResourcePermit, BulkheadError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(BulkheadError::Closed {
                pool: self.inner.name.clone(),
            });
        }
        // Queued callers come first
        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            state.total_acquired += 1;
            return Ok(ResourcePermit {
                pool: Some(self.inner.clone()),
            });
        }
        state.total_timeouts += 1;
        Err(BulkheadError::ResourceExhausted {
            pool: self.inner.name.clone(),
            timeout: Duration::ZERO,
        })
    }

    /// Acquire a permit, waiting in FIFO order for at most `timeout`
    pub async fn acquire(&self, timeout: Duration) -> Result<ResourcePermit, BulkheadError> {
        let (waiter_id, receiver) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(BulkheadError::Closed {
                    pool: self.inner.name.clone(),
                });
            }
            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                state.total_acquired += 1;
                return Ok(ResourcePermit {
                    pool: Some(self.inner.clone()),
                });
            }

            let (sender, receiver) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, sender });
            debug!(
                pool = %self.inner.name,
                waiter = id,
                queue_length = state.waiters.len(),
                "Waiting for permit"
            );
            (id, receiver)
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(BulkheadError::Closed {
                pool: self.inner.name.clone(),
            }),
            Err(_) => {
                let mut state = self.inner.state.lock();
                state.waiters.retain(|w| w.id != waiter_id);
                state.total_timeouts += 1;
                drop(state);

                // A permit sent just before the timeout fired is returned by
                // dropping the receiver, which drops the permit inside it.
                warn!(
                    pool = %self.inner.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "⏳ Resource pool exhausted"
                );
                Err(BulkheadError::ResourceExhausted {
                    pool: self.inner.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Close the pool: queued and future callers fail with [`BulkheadError::Closed`]
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        let dropped = state.waiters.len();
        state.waiters.clear();
        info!(pool = %self.inner.name, failed_waiters = dropped, "Resource pool closed");
    }

    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.available()
    }

    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            capacity: self.inner.capacity,
            available: state.available,
            in_use: self.inner.capacity - state.available,
            waiting: state.waiters.len(),
            total_acquired: state.total_acquired,
            total_timeouts: state.total_timeouts,
        }
    }
}

/// Resource pools keyed by resource class
#[derive(Debug)]
pub struct BulkheadRegistry {
    pools: DashMap<String, ResourcePool>,
    default_capacity: usize,
    acquire_timeout: Duration,
}

impl BulkheadRegistry {
    pub fn new(default_capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            pools: DashMap::new(),
            default_capacity,
            acquire_timeout,
        }
    }

    pub fn from_config(settings: &ResourcePoolSettings) -> Self {
        let registry = Self::new(settings.default_capacity, settings.acquire_timeout());
        for (class, capacity) in &settings.pools {
            registry
                .pools
                .insert(class.clone(), ResourcePool::new(class.clone(), *capacity));
        }
        registry
    }

    /// Pool for a resource class, created with the default capacity on first use
    pub fn pool(&self, resource_class: &str) -> ResourcePool {
        self.pools
            .entry(resource_class.to_string())
            .or_insert_with(|| ResourcePool::new(resource_class, self.default_capacity))
            .clone()
    }

    /// Register (or replace) a pool with an explicit capacity
    pub fn register(&self, resource_class: &str, capacity: usize) -> ResourcePool {
        let pool = ResourcePool::new(resource_class, capacity);
        self.pools.insert(resource_class.to_string(), pool.clone());
        pool
    }

    /// Acquire from a class pool using the registry's default timeout
    pub async fn acquire(&self, resource_class: &str) -> Result<ResourcePermit, BulkheadError> {
        self.pool(resource_class).acquire(self.acquire_timeout).await
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }
}
