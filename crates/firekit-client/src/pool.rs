//! Bounded pool of transport clients.
//!
//! Logical operations are multiplexed over a small set of clients. Each
//! client accepts up to `max_concurrent_per_client` operations; new clients
//! are created on demand up to `max_pool_size`, and callers beyond that are
//! queued FIFO and handed a slot directly when one frees up. Operations are
//! packed onto the busiest client with spare capacity so that surplus idle
//! clients can be reclaimed.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_pool_size;

/// Default per-client concurrency ceiling.
pub const DEFAULT_MAX_CONCURRENT_PER_CLIENT: usize = 100;

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum concurrent operations per client.
    pub max_concurrent_per_client: usize,
    /// Maximum number of clients.
    pub max_pool_size: usize,
    /// Idle clients kept alive once their last operation finishes.
    pub max_idle_clients: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_client: DEFAULT_MAX_CONCURRENT_PER_CLIENT,
            max_pool_size: usize::MAX,
            max_idle_clients: 1,
        }
    }
}

/// Creates transport clients for the pool.
pub trait ClientFactory<C>: Send + Sync {
    fn create(&self) -> FirestoreResult<C>;
}

impl<C, F> ClientFactory<C> for F
where
    F: Fn() -> FirestoreResult<C> + Send + Sync,
{
    fn create(&self) -> FirestoreResult<C> {
        self()
    }
}

struct PoolEntry<C> {
    id: u64,
    client: C,
    active: usize,
}

struct Slot<C> {
    id: u64,
    client: C,
}

struct Waiter<C> {
    tag: String,
    tx: oneshot::Sender<FirestoreResult<Slot<C>>>,
}

struct PoolState<C> {
    entries: Vec<PoolEntry<C>>,
    waiters: VecDeque<Waiter<C>>,
    next_id: u64,
    terminated: bool,
}

impl<C> PoolState<C> {
    fn active(&self) -> usize {
        self.entries.iter().map(|e| e.active).sum()
    }

    fn outstanding(&self) -> usize {
        self.active() + self.waiters.len()
    }

    fn release_slot(&mut self, id: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.active = entry.active.saturating_sub(1);
        }
    }
}

struct PoolInner<C> {
    config: PoolConfig,
    factory: Box<dyn ClientFactory<C>>,
    state: Mutex<PoolState<C>>,
    /// Active plus queued operations; `terminate` waits for zero.
    outstanding: watch::Sender<usize>,
}

/// Pool of clients shared by every request issued through a `Firestore`.
pub struct ClientPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ClientPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Clone + Send + 'static> ClientPool<C> {
    pub fn new(config: PoolConfig, factory: impl ClientFactory<C> + 'static) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(PoolInner {
                config: PoolConfig {
                    max_concurrent_per_client: config.max_concurrent_per_client.max(1),
                    max_pool_size: config.max_pool_size.max(1),
                    max_idle_clients: config.max_idle_clients,
                },
                factory: Box::new(factory),
                state: Mutex::new(PoolState {
                    entries: Vec::new(),
                    waiters: VecDeque::new(),
                    next_id: 0,
                    terminated: false,
                }),
                outstanding,
            }),
        }
    }

    /// Run `op` with a client, holding one slot for its duration.
    pub async fn run<T, F, Fut>(&self, tag: &str, op: F) -> FirestoreResult<T>
    where
        F: FnOnce(C) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        let lease = self.acquire(tag).await?;
        let result = op(lease.client().clone()).await;
        drop(lease);
        result
    }

    /// Reserve a slot; the slot is released when the lease is dropped.
    pub async fn acquire(&self, tag: &str) -> FirestoreResult<PoolLease<C>> {
        let rx = {
            let mut state = self.inner.lock();
            if state.terminated {
                return Err(FirestoreError::PoolTerminated);
            }

            // Queued callers keep their place: no overtaking.
            if state.waiters.is_empty() {
                if let Some(slot) = self.inner.try_assign(&mut state)? {
                    trace!(request_tag = %tag, client_id = slot.id, "Assigned pooled client");
                    self.inner.publish(&state);
                    return Ok(PoolLease::new(Arc::clone(&self.inner), slot));
                }
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                tag: tag.to_string(),
                tx,
            });
            debug!(
                request_tag = %tag,
                queued = state.waiters.len(),
                "All pooled clients saturated, queueing request"
            );
            self.inner.publish(&state);
            rx
        };

        match rx.await {
            Ok(Ok(slot)) => Ok(PoolLease::new(Arc::clone(&self.inner), slot)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FirestoreError::PoolTerminated),
        }
    }

    /// Stop accepting work, wait for queued and in-flight operations to
    /// finish, then drop every client.
    pub async fn terminate(&self) {
        {
            let mut state = self.inner.lock();
            state.terminated = true;
            state.waiters.retain(|w| !w.tx.is_closed());
            self.inner.publish(&state);
        }

        let mut rx = self.inner.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;

        let mut state = self.inner.lock();
        let destroyed = state.entries.len();
        state.entries.clear();
        self.inner.publish(&state);
        debug!(destroyed, "Client pool terminated");
    }

    /// Number of live clients.
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Operations currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.inner.lock().active()
    }

    /// Operations waiting for a slot.
    pub fn queued_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminated
    }
}

impl<C: Clone> PoolInner<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a slot on the busiest client with spare capacity, creating a
    /// client if every existing one is saturated.
    fn try_assign(&self, state: &mut PoolState<C>) -> FirestoreResult<Option<Slot<C>>> {
        let limit = self.config.max_concurrent_per_client;
        let candidate = state
            .entries
            .iter_mut()
            .filter(|e| e.active < limit)
            .max_by_key(|e| e.active);

        if let Some(entry) = candidate {
            entry.active += 1;
            return Ok(Some(Slot {
                id: entry.id,
                client: entry.client.clone(),
            }));
        }

        if state.entries.len() >= self.config.max_pool_size {
            return Ok(None);
        }

        let client = self.factory.create()?;
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(PoolEntry {
            id,
            client: client.clone(),
            active: 1,
        });
        debug!(client_id = id, pool_size = state.entries.len(), "Created pooled client");
        Ok(Some(Slot { id, client }))
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        state.release_slot(id);
        self.dispatch_waiters(&mut state);
        self.collect_idle(&mut state);
        self.publish(&state);
    }

    /// Hand freed capacity to queued callers in arrival order.
    fn dispatch_waiters(&self, state: &mut PoolState<C>) {
        while let Some(front) = state.waiters.front() {
            if front.tx.is_closed() {
                state.waiters.pop_front();
                continue;
            }

            match self.try_assign(state) {
                Ok(Some(slot)) => {
                    let Some(waiter) = state.waiters.pop_front() else {
                        state.release_slot(slot.id);
                        break;
                    };
                    let slot_id = slot.id;
                    trace!(request_tag = %waiter.tag, client_id = slot_id, "Dispatching queued request");
                    if waiter.tx.send(Ok(slot)).is_err() {
                        // Caller gave up between the check and the send.
                        state.release_slot(slot_id);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if let Some(waiter) = state.waiters.pop_front() {
                        let _ = waiter.tx.send(Err(e));
                    }
                }
            }
        }
    }

    /// Drop idle clients beyond the retention count.
    fn collect_idle(&self, state: &mut PoolState<C>) {
        let keep = if state.terminated && state.outstanding() == 0 {
            0
        } else {
            self.config.max_idle_clients
        };

        let mut idle_seen = 0;
        let before = state.entries.len();
        state.entries.retain(|entry| {
            if entry.active > 0 {
                return true;
            }
            idle_seen += 1;
            idle_seen <= keep
        });

        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, pool_size = state.entries.len(), "Destroyed idle pooled clients");
        }
    }

    fn publish(&self, state: &PoolState<C>) {
        self.outstanding.send_replace(state.outstanding());
        record_pool_size(state.entries.len());
    }
}

/// A reserved pool slot. Dropping it releases the slot.
pub struct PoolLease<C: Clone> {
    pool: Arc<PoolInner<C>>,
    id: u64,
    client: C,
}

impl<C: Clone> PoolLease<C> {
    fn new(pool: Arc<PoolInner<C>>, slot: Slot<C>) -> Self {
        Self {
            pool,
            id: slot.id,
            client: slot.client,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: Clone> Drop for PoolLease<C> {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_pool(config: PoolConfig) -> (ClientPool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = ClientPool::new(config, move || -> FirestoreResult<usize> {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        });
        (pool, created)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_third_caller_queues_until_capacity_frees() {
        let (pool, _) = counting_pool(PoolConfig {
            max_concurrent_per_client: 2,
            max_pool_size: 1,
            max_idle_clients: 1,
        });

        let started = Arc::new(AtomicUsize::new(0));
        let mut gates = Vec::new();
        let mut handles = Vec::new();
        for i in 0..3usize {
            let (tx, rx) = oneshot::channel::<()>();
            gates.push(tx);
            let pool = pool.clone();
            let started = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                pool.run(&format!("op-{i}"), |_client| async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    let _ = rx.await;
                    Ok(i)
                })
                .await
            }));
        }

        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.queued_count(), 1);
        assert_eq!(pool.size(), 1);

        gates.remove(0).send(()).unwrap();
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(pool.queued_count(), 0);
        assert!(pool.active_count() <= 2);

        for gate in gates {
            let _ = gate.send(());
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), i);
        }
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_creates_clients_up_to_pool_size() {
        let (pool, created) = counting_pool(PoolConfig {
            max_concurrent_per_client: 1,
            max_pool_size: 2,
            max_idle_clients: 2,
        });

        let a = pool.acquire("a").await.unwrap();
        let b = pool.acquire("b").await.unwrap();
        assert_ne!(a.client(), b.client());
        assert_eq!(pool.size(), 2);
        assert_eq!(created.load(Ordering::SeqCst), 2);

        drop(a);
        drop(b);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_packs_onto_busiest_client() {
        let (pool, created) = counting_pool(PoolConfig {
            max_concurrent_per_client: 3,
            max_pool_size: 4,
            max_idle_clients: 4,
        });

        let first = pool.acquire("first").await.unwrap();
        let second = pool.acquire("second").await.unwrap();
        assert_eq!(first.client(), second.client());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_clients_beyond_retention_are_destroyed() {
        let (pool, _) = counting_pool(PoolConfig {
            max_concurrent_per_client: 1,
            max_pool_size: 3,
            max_idle_clients: 1,
        });

        let leases = vec![
            pool.acquire("a").await.unwrap(),
            pool.acquire("b").await.unwrap(),
            pool.acquire("c").await.unwrap(),
        ];
        assert_eq!(pool.size(), 3);

        drop(leases);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_ceiling_holds_under_concurrency() {
        let (pool, _) = counting_pool(PoolConfig {
            max_concurrent_per_client: 2,
            max_pool_size: 2,
            max_idle_clients: 1,
        });
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..20u64 {
            let pool = pool.clone();
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                pool.run("burst", |_client| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1 + (i % 3))).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_slot() {
        let (pool, _) = counting_pool(PoolConfig {
            max_concurrent_per_client: 1,
            max_pool_size: 1,
            max_idle_clients: 1,
        });

        let lease = pool.acquire("held").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("next").await.map(|l| *l.client()) })
        };
        settle().await;
        assert_eq!(pool.queued_count(), 1);

        drop(lease);
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let (pool, _) = counting_pool(PoolConfig {
            max_concurrent_per_client: 1,
            max_pool_size: 1,
            max_idle_clients: 1,
        });

        let lease = pool.acquire("held").await.unwrap();
        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("abandoned").await.map(|_| ()) })
        };
        settle().await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(lease);
        assert_eq!(pool.queued_count(), 0);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_drains_then_rejects() {
        let (pool, _) = counting_pool(PoolConfig::default());

        let (tx, rx) = oneshot::channel::<()>();
        let in_flight = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.run("slow", |_client| async move {
                    let _ = rx.await;
                    Ok("done")
                })
                .await
            })
        };
        settle().await;

        let terminating = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.terminate().await })
        };
        settle().await;
        assert!(!terminating.is_finished());
        assert!(matches!(
            pool.run("late", |_c| async { Ok(()) }).await,
            Err(FirestoreError::PoolTerminated)
        ));

        tx.send(()).unwrap();
        assert_eq!(in_flight.await.unwrap().unwrap(), "done");
        terminating.await.unwrap();
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_factory_failure_propagates() {
        let pool: ClientPool<usize> =
            ClientPool::new(PoolConfig::default(), || -> FirestoreResult<usize> {
                Err(FirestoreError::auth_error("no credentials"))
            });
        let result = pool.run("op", |_c| async { Ok(()) }).await;
        assert!(matches!(result, Err(FirestoreError::AuthError(_))));
        assert_eq!(pool.size(), 0);
    }
}
