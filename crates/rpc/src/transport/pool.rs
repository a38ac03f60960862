//! Pooled RPC clients, one pool per remote endpoint.

use crate::error::{ConnectionError, Error, Result};
use crate::transport::client::{ClientConfig, RpcClient};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for a client pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle clients maintenance tries to keep around.
    pub min_idle: usize,
    /// Idle clients kept after release; extras are closed.
    pub max_idle: usize,
    /// Maximum clients borrowed at once.
    pub max_total: usize,
    /// How long a borrow waits for capacity.
    pub max_wait: Duration,
    /// Idle clients older than this are evicted (down to `min_idle`).
    pub idle_eviction: Duration,
    /// Period of the eviction and top-up pass.
    pub eviction_interval: Duration,
    /// Hand out the most recently released client first.
    pub lifo: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_idle: 10,
            max_total: 10,
            max_wait: Duration::from_millis(200),
            idle_eviction: Duration::from_secs(60 * 60),
            eviction_interval: Duration::from_secs(10 * 60),
            lifo: true,
        }
    }
}

struct IdleClient {
    client: RpcClient,
    since: Instant,
}

/// Pool of connected clients for a single endpoint.
pub struct ClientPool {
    addr: String,
    client_config: ClientConfig,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleClient>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    maintenance: CancellationToken,
}

impl ClientPool {
    /// Create a pool for `addr` (`host:port`). Clients are created lazily.
    #[must_use]
    pub fn new(addr: impl Into<String>, client_config: ClientConfig, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            client_config,
            permits: Arc::new(Semaphore::new(config.max_total)),
            config,
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            maintenance: CancellationToken::new(),
        })
    }

    /// Endpoint served by this pool.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Clients sitting idle.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Clients currently borrowed.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.config
            .max_total
            .saturating_sub(self.permits.available_permits())
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start the background eviction and top-up task.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let cancel = self.maintenance.clone();
        let period = self.config.eviction_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = Weak::upgrade(&pool) else { break };
                        pool.evict_idle(Instant::now());
                        pool.fill_idle().await;
                    }
                }
            }
        });
    }

    /// Borrow a connected client, waiting at most `max_wait` for capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when no capacity frees up in time, or
    /// the connect error when a fresh or stale client cannot be connected.
    pub async fn borrow(self: &Arc<Self>) -> Result<PooledClient> {
        if self.is_closed() {
            return Err(ConnectionError::ShuttingDown.into());
        }

        let permit = timeout(self.config.max_wait, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| {
                Error::PoolExhausted(format!(
                    "no client for {} within {:?} ({} borrowed)",
                    self.addr,
                    self.config.max_wait,
                    self.active_count()
                ))
            })?
            .map_err(|_| ConnectionError::ShuttingDown)?;

        let client = match self.take_idle() {
            Some(client) if client.is_connected() => client,
            Some(client) => {
                debug!("Reconnecting stale pooled client for {}", self.addr);
                client.reconnect().await?;
                client
            }
            None => {
                let client = RpcClient::new(self.addr.clone(), self.client_config.clone());
                client.connect().await?;
                client
            }
        };

        Ok(PooledClient {
            client: Some(client),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Close every idle client and refuse further borrows. Borrowed clients
    /// are closed when they come back.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing client pool for {}", self.addr);

        self.maintenance.cancel();
        self.permits.close();
        for idle in self.idle.lock().drain(..) {
            idle.client.close();
        }
    }

    fn take_idle(&self) -> Option<RpcClient> {
        let mut idle = self.idle.lock();
        let entry = if self.config.lifo {
            idle.pop_back()
        } else {
            idle.pop_front()
        };
        entry.map(|entry| entry.client)
    }

    fn give_back(&self, client: RpcClient) {
        if self.is_closed() || !client.is_connected() {
            client.close();
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle {
            drop(idle);
            client.close();
            return;
        }
        idle.push_back(IdleClient {
            client,
            since: Instant::now(),
        });
    }

    /// Drop disconnected idle clients, then evict the oldest ones past
    /// `idle_eviction` while more than `min_idle` remain.
    fn evict_idle(&self, now: Instant) {
        let mut idle = self.idle.lock();
        idle.retain(|entry| {
            let keep = entry.client.is_connected();
            if !keep {
                entry.client.close();
            }
            keep
        });

        let mut evicted = 0;
        while idle.len() > self.config.min_idle {
            let Some(oldest) = idle.front() else { break };
            if now.duration_since(oldest.since) < self.config.idle_eviction {
                break;
            }
            if let Some(entry) = idle.pop_front() {
                entry.client.close();
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!("Evicted {} idle clients for {}", evicted, self.addr);
        }
    }

    /// Best-effort top-up of idle clients to `min_idle`.
    async fn fill_idle(&self) {
        let missing = self.config.min_idle.saturating_sub(self.idle_count());
        for _ in 0..missing {
            if self.is_closed() {
                return;
            }
            let client = RpcClient::new(self.addr.clone(), self.client_config.clone());
            if let Err(e) = client.connect().await {
                warn!("Failed to create idle client for {}: {}", self.addr, e);
                return;
            }
            self.give_back(client);
        }
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        self.maintenance.cancel();
    }
}

/// A client borrowed from a [`ClientPool`].
///
/// Call [`release`](Self::release) after a healthy exchange or
/// [`invalidate`](Self::invalidate) after a transport failure. Dropping the
/// guard releases the client if it is still connected and discards it
/// otherwise, so every exit path hands the slot back.
pub struct PooledClient {
    client: Option<RpcClient>,
    pool: Arc<ClientPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    /// Return the client to its pool.
    pub fn release(mut self) {
        if let Some(client) = self.client.take() {
            self.pool.give_back(client);
        }
    }

    /// Close the client instead of returning it.
    pub fn invalidate(mut self) {
        if let Some(client) = self.client.take() {
            debug!("Discarding broken client for {}", self.pool.addr);
            client.close();
        }
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("pool", &self.pool.addr)
            .field("client", &self.client)
            .finish()
    }
}

impl Deref for PooledClient {
    type Target = RpcClient;

    fn deref(&self) -> &RpcClient {
        // Only `release`/`invalidate`/`drop` take the client, and they consume the guard
        self.client
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled client already returned"))
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.give_back(client);
        }
    }
}

/// Registry of pools keyed by `host:port`.
pub struct ClientPools {
    pools: DashMap<String, Arc<ClientPool>>,
    client_config: ClientConfig,
    config: PoolConfig,
}

impl ClientPools {
    /// Create an empty registry; pools are created on first use.
    #[must_use]
    pub fn new(client_config: ClientConfig, config: PoolConfig) -> Self {
        Self {
            pools: DashMap::new(),
            client_config,
            config,
        }
    }

    /// Pool for `host:port`, created and started on first use.
    #[must_use]
    pub fn get(&self, host: &str, port: u16) -> Arc<ClientPool> {
        let key = format!("{host}:{port}");
        if let Some(pool) = self.pools.get(&key) {
            return Arc::clone(pool.value());
        }

        self.pools
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Creating client pool for {}", key);
                let pool = ClientPool::new(
                    key.clone(),
                    self.client_config.clone(),
                    self.config.clone(),
                );
                pool.start();
                pool
            })
            .clone()
    }

    /// Close and forget the pool for `host:port`.
    pub fn remove(&self, host: &str, port: u16) {
        if let Some((_, pool)) = self.pools.remove(&format!("{host}:{port}")) {
            pool.close();
        }
    }

    /// Close and forget every pool whose key fails `keep`.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        let doomed: Vec<String> = self
            .pools
            .iter()
            .filter(|entry| !keep(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for key in doomed {
            if let Some((_, pool)) = self.pools.remove(&key) {
                info!("Dropping client pool for departed endpoint {}", key);
                pool.close();
            }
        }
    }

    /// Endpoints with a pool.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close every pool.
    pub fn close_all(&self) {
        for entry in &self.pools {
            entry.value().close();
        }
        self.pools.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_borrow_from_unreachable_endpoint_frees_slot() {
        // Nothing listens on port 1
        let pool = ClientPool::new(
            "127.0.0.1:1",
            ClientConfig::default(),
            PoolConfig {
                max_total: 1,
                ..PoolConfig::default()
            },
        );

        assert!(pool.borrow().await.is_err());
        assert_eq!(pool.active_count(), 0);
        assert!(pool.borrow().await.is_err());
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_borrow() {
        let pool = ClientPool::new("127.0.0.1:1", ClientConfig::default(), PoolConfig::default());
        pool.close();

        assert!(matches!(
            pool.borrow().await,
            Err(Error::Connection(ConnectionError::ShuttingDown))
        ));
    }

    #[tokio::test]
    async fn test_registry_shares_and_removes_pools() {
        let pools = ClientPools::new(ClientConfig::default(), PoolConfig::default());
        let a = pools.get("127.0.0.1", 9000);
        let b = pools.get("127.0.0.1", 9000);
        assert!(Arc::ptr_eq(&a, &b));

        pools.get("127.0.0.1", 9001);
        pools.retain(|key| key == "127.0.0.1:9001");

        assert!(a.is_closed());
        assert_eq!(pools.endpoints(), vec!["127.0.0.1:9001".to_string()]);

        pools.remove("127.0.0.1", 9001);
        assert!(pools.endpoints().is_empty());
    }
}
