//! Cluster-wide leadership lock
//!
//! Ensures at most one scheduler instance ticks at a time, even when
//! several are started. The broker holds the lock: `SET NX PX` with a
//! per-instance fencing token, renewed before every tick and checked on
//! release so a stale holder can never stomp a newer one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use redis::Script;
use uuid::Uuid;

use crate::clock::{to_chrono, Clock};
use crate::config::BrokerSettings;
use crate::error::{OrchestratorError, Result};

/// Renew the TTL if the caller still holds the lock.
static RENEW_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            redis.call('PEXPIRE', KEYS[1], ARGV[2])
            return 1
        end
        return 0
        ",
    )
});

/// Drop the lock if the caller still holds it.
static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            redis.call('DEL', KEYS[1])
            return 1
        end
        return 0
        ",
    )
});

/// Mutual exclusion for logically-singleton components.
#[async_trait]
pub trait LeadershipLock: Send + Sync {
    /// Try to take the lock. Non-blocking; `false` means another holder.
    async fn try_acquire(&self) -> Result<bool>;

    /// Extend the lock's TTL. `false` means leadership was lost.
    async fn renew(&self) -> Result<bool>;

    /// Give the lock up if still held.
    async fn release(&self) -> Result<()>;
}

/// Broker-backed leadership lock.
pub struct RedisLeadershipLock {
    pool: Pool,
    key: String,
    holder: String,
    ttl_ms: i64,
}

impl RedisLeadershipLock {
    /// Lock under `namespace` with the given TTL.
    #[must_use]
    pub fn new(pool: Pool, namespace: &str, ttl: Duration) -> Self {
        Self {
            pool,
            key: format!("{namespace}:scheduler:leader"),
            holder: Uuid::new_v4().to_string(),
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Build a dedicated pool from broker settings and wrap it.
    ///
    /// # Errors
    ///
    /// Fails when the broker URL does not parse or the pool cannot be
    /// created.
    pub fn connect(settings: &BrokerSettings, ttl: Duration) -> Result<Self> {
        let pool = PoolConfig::from_url(settings.url())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| OrchestratorError::Config(format!("broker pool: {err}")))?;
        Ok(Self::new(pool, &settings.namespace, ttl))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|err| OrchestratorError::TransientDependency {
                name: "broker".to_string(),
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl LeadershipLock for RedisLeadershipLock {
    async fn try_acquire(&self) -> Result<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.holder)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn renew(&self) -> Result<bool> {
        let mut conn = self.conn().await?;
        let renewed: i64 = RENEW_SCRIPT
            .key(&self.key)
            .arg(&self.holder)
            .arg(self.ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _released: i64 = RELEASE_SCRIPT
            .key(&self.key)
            .arg(&self.holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug)]
struct Holder {
    id: Uuid,
    expires_at: DateTime<Utc>,
}

/// Shared in-process lock state, standing in for the broker.
#[derive(Clone)]
pub struct MemoryLeadershipRegistry {
    state: Arc<Mutex<Option<Holder>>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl MemoryLeadershipRegistry {
    /// Registry on an explicit clock.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            clock,
            ttl,
        }
    }

    /// A handle for one would-be leader.
    #[must_use]
    pub fn lock(&self) -> MemoryLeadershipLock {
        MemoryLeadershipLock {
            registry: self.clone(),
            id: Uuid::new_v4(),
        }
    }
}

/// One instance's handle onto a [`MemoryLeadershipRegistry`].
pub struct MemoryLeadershipLock {
    registry: MemoryLeadershipRegistry,
    id: Uuid,
}

#[async_trait]
impl LeadershipLock for MemoryLeadershipLock {
    async fn try_acquire(&self) -> Result<bool> {
        let now = self.registry.clock.now();
        let mut state = self.registry.state.lock();
        let free = match state.as_ref() {
            None => true,
            Some(holder) => holder.id == self.id || holder.expires_at <= now,
        };
        if free {
            *state = Some(Holder {
                id: self.id,
                expires_at: now + to_chrono(self.registry.ttl),
            });
        }
        Ok(free)
    }

    async fn renew(&self) -> Result<bool> {
        let now = self.registry.clock.now();
        let mut state = self.registry.state.lock();
        match state.as_mut() {
            Some(holder) if holder.id == self.id && holder.expires_at > now => {
                holder.expires_at = now + to_chrono(self.registry.ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self) -> Result<()> {
        let mut state = self.registry.state.lock();
        if state.as_ref().is_some_and(|holder| holder.id == self.id) {
            *state = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry(ttl_secs: u64) -> (MemoryLeadershipRegistry, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let registry =
            MemoryLeadershipRegistry::new(Arc::new(clock.clone()), Duration::from_secs(ttl_secs));
        (registry, clock)
    }

    #[tokio::test]
    async fn only_one_holder_at_a_time() {
        let (registry, _clock) = registry(15);
        let a = registry.lock();
        let b = registry.lock();

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        assert!(a.renew().await.unwrap());
        assert!(!b.renew().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let (registry, clock) = registry(15);
        let a = registry.lock();
        let b = registry.lock();

        assert!(a.try_acquire().await.unwrap());
        clock.advance(Duration::from_secs(16));

        assert!(b.try_acquire().await.unwrap());
        assert!(!a.renew().await.unwrap());
    }

    #[tokio::test]
    async fn release_frees_the_lock_only_for_the_holder() {
        let (registry, _clock) = registry(15);
        let a = registry.lock();
        let b = registry.lock();

        assert!(a.try_acquire().await.unwrap());
        b.release().await.unwrap();
        assert!(!b.try_acquire().await.unwrap());

        a.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
    }
}
