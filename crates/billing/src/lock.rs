//! Lease-based distributed lock.
//!
//! Cross-process mutual exclusion for operations on shared external state
//! (credential refresh and the like — NOT the ledger, which relies on
//! database row locks). `acquire` hands back a lease carrying a random
//! token; `release` and `renew` only act if the stored value still matches
//! that token, so an expired lease that someone else re-acquired can never
//! be released out from under them.
//!
//! The intended loser behavior is thundering-herd control: a caller that
//! fails to acquire waits out the cooldown and re-reads the (by then
//! refreshed) state instead of retrying the refresh itself.

use std::time::Duration;

use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A held lease. Dropping it without `release` lets it expire on its own.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    token: String,
}

/// Redis-backed lease lock.
#[derive(Clone)]
pub struct LeaseLock {
    conn: ConnectionManager,
    /// How long a loser should wait before re-reading state.
    cooldown: Duration,
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

impl LeaseLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            cooldown: Duration::from_millis(500),
        }
    }

    pub async fn connect(redis_url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BillingError::Lock(format!("Invalid Redis URL: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BillingError::Lock(format!("Redis connection failed: {}", e)))?;
        Ok(Self::new(conn))
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Try to acquire the lock. Returns the lease on success, `None` when
    /// someone else holds it.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> BillingResult<Option<Lease>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| BillingError::Lock(e.to_string()))?;

        Ok(set.map(|_| Lease {
            key: key.to_string(),
            token,
        }))
    }

    /// Release a held lease. Returns false if the lease already expired and
    /// was re-acquired elsewhere (in which case nothing was deleted).
    pub async fn release(&self, lease: &Lease) -> BillingResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BillingError::Lock(e.to_string()))?;
        Ok(deleted > 0)
    }

    /// Extend a held lease. Returns false if the lease is no longer ours.
    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> BillingResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BillingError::Lock(e.to_string()))?;
        Ok(renewed > 0)
    }

    /// Loser path: wait out the cooldown so the holder can finish, then let
    /// the caller re-read the refreshed state.
    pub async fn wait_cooldown(&self) {
        tokio::time::sleep(self.cooldown).await;
    }
}
