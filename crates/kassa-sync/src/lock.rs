//! # Cycle Lease Lock
//!
//! Serializes sync cycles when several adapter instances share one buffer.
//!
//! ## Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Redis Lease Protocol                                │
//! │                                                                         │
//! │  acquire:  SET kassa:sync:lease <token> NX PX <ttl_ms>                 │
//! │            │                                                            │
//! │            ├── OK   → this instance runs the cycle                      │
//! │            └── nil  → another instance holds it; skip, next tick       │
//! │                                                                         │
//! │  release:  Lua compare-and-delete                                      │
//! │            if GET(key) == <token> then DEL(key)                        │
//! │            (never deletes a lease that expired and was re-acquired     │
//! │             by someone else)                                           │
//! │                                                                         │
//! │  crash:    no release happens; the TTL expires and the lease frees     │
//! │            itself. TTL must exceed the longest possible cycle.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncResult;

/// Redis key guarding the sync cycle.
const LEASE_KEY: &str = "kassa:sync:lease";

// =============================================================================
// Trait
// =============================================================================

/// A TTL-based mutual exclusion lease for the sync cycle.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Tries to acquire the lease without blocking.
    ///
    /// Returns the fencing token on success, `None` when another holder
    /// has it. A backend failure also yields `None`: a cycle skipped is
    /// safe, a cycle run twice concurrently is not.
    async fn try_acquire(&self) -> Option<String>;

    /// Releases a lease previously acquired with the given token.
    ///
    /// A no-op when the token no longer matches (the lease expired and
    /// was taken over).
    async fn release(&self, token: &str) -> SyncResult<()>;
}

// =============================================================================
// Redis Lease
// =============================================================================

/// Redis-backed lease for multi-instance deployments.
pub struct RedisLeaseLock {
    client: redis::Client,
    ttl: Duration,
}

impl RedisLeaseLock {
    /// Creates a lease handle.
    ///
    /// `ttl` must comfortably exceed the longest sync cycle, so a live
    /// holder never loses the lease mid-drain.
    pub fn new(redis_url: &str, ttl: Duration) -> SyncResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(RedisLeaseLock { client, ttl })
    }
}

#[async_trait]
impl LeaseLock for RedisLeaseLock {
    async fn try_acquire(&self) -> Option<String> {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Lease backend unreachable, skipping cycle");
                return None;
            }
        };

        let token = Uuid::new_v4().to_string();

        // SET key token NX PX ttl
        let result: Result<Option<String>, _> = redis::cmd("SET")
            .arg(LEASE_KEY)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => {
                debug!(token = %token, "Sync lease acquired");
                Some(token)
            }
            Ok(None) => {
                debug!("Sync lease held by another instance");
                None
            }
            Err(e) => {
                warn!(error = %e, "Lease acquire failed, skipping cycle");
                None
            }
        }
    }

    async fn release(&self, token: &str) -> SyncResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Compare-and-delete: only the current holder's token releases
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
            "#,
        );

        let deleted: i64 = script.key(LEASE_KEY).arg(token).invoke_async(&mut conn).await?;

        if deleted == 0 {
            warn!(token = %token, "Lease already expired or taken over at release");
        }

        Ok(())
    }
}

// =============================================================================
// Local Lease
// =============================================================================

/// In-process lease for single-instance deployments (no Redis configured).
///
/// Provides the same exclusion guarantee within one process: a manual
/// trigger cannot overlap a timer-driven cycle.
#[derive(Debug, Default)]
pub struct LocalLeaseLock {
    holder: Mutex<Option<String>>,
}

impl LocalLeaseLock {
    /// Creates an unheld local lease.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseLock for LocalLeaseLock {
    async fn try_acquire(&self) -> Option<String> {
        let mut holder = self.holder.lock().expect("lease lock poisoned");
        if holder.is_some() {
            return None;
        }

        let token = Uuid::new_v4().to_string();
        *holder = Some(token.clone());
        Some(token)
    }

    async fn release(&self, token: &str) -> SyncResult<()> {
        let mut holder = self.holder.lock().expect("lease lock poisoned");
        if holder.as_deref() == Some(token) {
            *holder = None;
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_lease_excludes() {
        let lock = LocalLeaseLock::new();

        let token = lock.try_acquire().await.unwrap();
        assert!(lock.try_acquire().await.is_none());

        lock.release(&token).await.unwrap();
        assert!(lock.try_acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_local_lease_release_checks_token() {
        let lock = LocalLeaseLock::new();

        let token = lock.try_acquire().await.unwrap();

        // A stale token does not free the lease
        lock.release("stale-token").await.unwrap();
        assert!(lock.try_acquire().await.is_none());

        lock.release(&token).await.unwrap();
        assert!(lock.try_acquire().await.is_some());
    }
}
