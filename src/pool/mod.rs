//! C4 — a keyed multiplex cache of [`SshClient`]s with idle eviction,
//! max-size eviction, periodic health sweeps, and an event bus.
//!
//! The map itself is a [`dashmap::DashMap`] (sharded internally, so one
//! key's mutation never blocks another key's lookup); per-entry state
//! additionally lives behind the entry's own `parking_lot::Mutex` for the
//! fields the background tasks mutate concurrently with `get`/`release`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::Notify;

use crate::error::{Error, ErrorKind, Result};
use crate::ssh::factory::ConnectionFactory;
use crate::ssh::{ConnectionConfig, ConnectionKey, SshClient};
use crate::tracer::{Field, SpanStatus, Tracer};

#[derive(Debug, Clone)]
pub enum PoolEvent {
    Created(ConnectionKey),
    Reused(ConnectionKey),
    Evicted(ConnectionKey, EvictReason),
    HealthCheckFailed(ConnectionKey),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Idle,
    Disconnected,
    CapacityLru,
    UnhealthyTwice,
}

struct Entry {
    client: SshClient,
    created_at: Instant,
    last_used: parking_lot::Mutex<Instant>,
    use_count: AtomicU64,
    healthy: std::sync::atomic::AtomicBool,
    consecutive_failures: AtomicU64,
    last_response_time: parking_lot::Mutex<Option<Duration>>,
}

impl Entry {
    fn new(client: SshClient) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_used: parking_lot::Mutex::new(now),
            use_count: AtomicU64::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
            consecutive_failures: AtomicU64::new(0),
            last_response_time: parking_lot::Mutex::new(None),
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
        self.use_count.fetch_add(1, Ordering::Relaxed);
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Snapshot returned by [`ConnectionPool::health_check`].
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub total_entries: usize,
    pub healthy_entries: usize,
    pub unhealthy_entries: usize,
    pub failed_connections: u64,
    pub per_key_last_response: Vec<(ConnectionKey, Option<Duration>)>,
}

/// Construction-time invariants, rejected eagerly rather than discovered
/// at the first `get`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_idle: Duration,
    pub health_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            max_idle: Duration::from_secs(600),
            health_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=1000).contains(&self.max_connections) {
            return Err(Error::invalid_config("max_connections must be in [1, 1000]"));
        }
        if self.max_idle.is_zero() || self.max_idle > Duration::from_secs(24 * 3600) {
            return Err(Error::invalid_config("max_idle must be in (0, 24h]"));
        }
        if self.health_interval < Duration::from_secs(1) {
            return Err(Error::invalid_config("health_interval must be >= 1s"));
        }
        if self.cleanup_interval < Duration::from_secs(10) {
            return Err(Error::invalid_config("cleanup_interval must be >= 10s"));
        }
        if self.cleanup_interval < self.health_interval {
            return Err(Error::invalid_config("cleanup_interval must be >= health_interval"));
        }
        if self.health_interval >= self.max_idle {
            return Err(Error::invalid_config("health_interval must be < max_idle"));
        }
        Ok(())
    }
}

struct Shared {
    entries: DashMap<ConnectionKey, Arc<Entry>>,
    factory: ConnectionFactory,
    config: PoolConfig,
    tracer: Tracer,
    events: broadcast::Sender<PoolEvent>,
    failed_connections: AtomicU64,
    stop: Notify,
    stopped: std::sync::atomic::AtomicBool,
}

/// The pool. Cheap to clone; clones share the same map and background
/// tasks. `close()` stops the background tasks and is idempotent.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    pub fn new(factory: ConnectionFactory, config: PoolConfig, tracer: Tracer) -> Result<Self> {
        config.validate()?;
        let (tx, _rx) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            entries: DashMap::new(),
            factory,
            config,
            tracer: tracer.scoped("pool"),
            events: tx,
            failed_connections: AtomicU64::new(0),
            stop: Notify::new(),
            stopped: std::sync::atomic::AtomicBool::new(false),
        });
        let pool = Self { shared };
        pool.spawn_cleaner();
        pool.spawn_health_sweeper();
        Ok(pool)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    fn publish(&self, event: PoolEvent) {
        // Non-blocking delivery: broadcast::Sender::send never blocks: a
        // lagging receiver just misses the oldest messages (its next recv
        // returns `Lagged`). Drop-oldest is the intended behavior here.
        let _ = self.shared.events.send(event);
    }

    /// Reuse a healthy, fresh, connected entry if one exists; otherwise
    /// evict a stale entry, make room by evicting LRU if at capacity, then
    /// create and connect a fresh client.
    pub async fn get(&self, config: ConnectionConfig) -> Result<SshClient> {
        let key = config.key();
        let span = self.shared.tracer.start("get");
        span.set("key", Field::Str(key.to_string()));

        // Step 1/2: reuse or evict an existing entry for this key.
        if let Some(entry) = self.shared.entries.get(&key).map(|e| e.clone()) {
            let fresh_enough = entry.last_used().elapsed() < self.shared.config.max_idle;
            if entry.is_healthy() && fresh_enough && entry.client.is_connected() {
                entry.touch();
                self.publish(PoolEvent::Reused(key.clone()));
                entry.client.mark_in_use();
                span.end(SpanStatus::Ok);
                return Ok(entry.client.clone());
            }
            let _ = entry.client.close().await;
            self.shared.entries.remove(&key);
            self.publish(PoolEvent::Evicted(key.clone(), EvictReason::Disconnected));
        }

        // Step 3: evict LRU if at capacity.
        if self.shared.entries.len() >= self.shared.config.max_connections {
            if !self.evict_one(&key).await {
                span.end(SpanStatus::Error);
                return Err(Error::new(ErrorKind::PoolExhausted, "no evictable entry and at capacity"));
            }
        }

        // Step 4/5: create and connect.
        let client = self.shared.factory.create(config)?;
        if let Err(e) = client.connect().await {
            self.shared.failed_connections.fetch_add(1, Ordering::Relaxed);
            span.end(SpanStatus::Error);
            return Err(e);
        }
        client.mark_in_use();
        self.shared.entries.insert(key.clone(), Arc::new(Entry::new(client.clone())));
        self.publish(PoolEvent::Created(key));
        span.end(SpanStatus::Ok);
        Ok(client)
    }

    /// Evict the entry with the oldest `last_used`, ties broken by lowest
    /// `use_count`, then by lowest key (lexicographic). Never evicts
    /// `except` itself (it hasn't been created yet at the call site, but
    /// kept as a guard for clarity). Returns whether an entry was evicted.
    async fn evict_one(&self, except: &ConnectionKey) -> bool {
        let victim = self
            .shared
            .entries
            .iter()
            .filter(|kv| kv.key() != except)
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .min_by(|(ka, ea), (kb, eb)| {
                ea.last_used()
                    .cmp(&eb.last_used())
                    .then_with(|| ea.use_count().cmp(&eb.use_count()))
                    .then_with(|| ka.cmp(kb))
            });

        match victim {
            Some((key, entry)) => {
                let _ = entry.client.close().await;
                self.shared.entries.remove(&key);
                self.publish(PoolEvent::Evicted(key, EvictReason::CapacityLru));
                true
            }
            None => false,
        }
    }

    /// Return a client to the pool. Marks it healthy unless it reports
    /// disconnected, in which case the entry is removed outright.
    pub async fn release(&self, client: &SshClient) {
        let key = client.key();
        if !client.is_connected() {
            if let Some((_, entry)) = self.shared.entries.remove(&key) {
                let _ = entry.client.close().await;
            }
            self.publish(PoolEvent::Evicted(key, EvictReason::Disconnected));
            return;
        }
        client.mark_idle();
        if let Some(entry) = self.shared.entries.get(&key) {
            entry.healthy.store(true, Ordering::Relaxed);
            entry.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        let mut total = 0;
        let mut healthy = 0;
        let mut per_key = Vec::new();
        for kv in self.shared.entries.iter() {
            total += 1;
            if kv.value().is_healthy() {
                healthy += 1;
            }
            per_key.push((kv.key().clone(), *kv.value().last_response_time.lock()));
        }
        HealthReport {
            total_entries: total,
            healthy_entries: healthy,
            unhealthy_entries: total - healthy,
            failed_connections: self.shared.failed_connections.load(Ordering::Relaxed),
            per_key_last_response: per_key,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop background tasks and close every entry.
    pub async fn close(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop.notify_waiters();
        let keys: Vec<ConnectionKey> = self.shared.entries.iter().map(|kv| kv.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.shared.entries.remove(&key) {
                let _ = entry.client.close().await;
            }
        }
        self.publish(PoolEvent::Closed);
    }

    fn spawn_cleaner(&self) {
        let pool = self.clone();
        let interval = pool.shared.config.cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.shared.stop.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let max_idle = pool.shared.config.max_idle;
                let stale: Vec<ConnectionKey> = pool
                    .shared
                    .entries
                    .iter()
                    .filter(|kv| kv.value().last_used().elapsed() > max_idle || !kv.value().client.is_connected())
                    .map(|kv| kv.key().clone())
                    .collect();
                for key in stale {
                    if let Some((_, entry)) = pool.shared.entries.remove(&key) {
                        let _ = entry.client.close().await;
                        pool.publish(PoolEvent::Evicted(key, EvictReason::Idle));
                    }
                }
            }
        });
    }

    fn spawn_health_sweeper(&self) {
        let pool = self.clone();
        let interval = pool.shared.config.health_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.shared.stop.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let keys: Vec<ConnectionKey> = pool.shared.entries.iter().map(|kv| kv.key().clone()).collect();
                for key in keys {
                    let Some(entry) = pool.shared.entries.get(&key).map(|e| e.clone()) else { continue };
                    match entry.client.ping(Duration::from_secs(5)).await {
                        Ok(rtt) => {
                            *entry.last_response_time.lock() = Some(rtt);
                            entry.healthy.store(true, Ordering::Relaxed);
                            entry.consecutive_failures.store(0, Ordering::Relaxed);
                        }
                        Err(_) => {
                            entry.healthy.store(false, Ordering::Relaxed);
                            let failures = entry.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            pool.publish(PoolEvent::HealthCheckFailed(key.clone()));
                            if failures >= 2 {
                                if let Some((_, entry)) = pool.shared.entries.remove(&key) {
                                    let _ = entry.client.close().await;
                                    pool.publish(PoolEvent::Evicted(key, EvictReason::UnhealthyTwice));
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_max_connections() {
        let mut cfg = PoolConfig::default();
        cfg.max_connections = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_health_interval_not_less_than_max_idle() {
        let mut cfg = PoolConfig::default();
        cfg.max_idle = Duration::from_secs(10);
        cfg.health_interval = Duration::from_secs(10);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_cleanup_interval_below_health_interval() {
        let mut cfg = PoolConfig::default();
        cfg.health_interval = Duration::from_secs(50);
        cfg.cleanup_interval = Duration::from_secs(20);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_validates() {
        assert!(PoolConfig::default().validate().is_ok());
    }
}
