//! Fixed-window rate limiting over the storage adapter.
//!
//! The limiter is a thin facade: the counter itself lives in the storage
//! adapter's atomic `increment_rate_limit`, so the window is shared by
//! every process using the same backing store.
//!
//! ## Keys
//!
//! Keys use structured prefixes so different scopes never collide:
//! `queue:<name>`, `user:<id>[:endpoint]`, `ip:<ip>[:endpoint]`,
//! `processor:<queue>:<name>`, and the engine-wide `global`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::store::StorageAdapter;

/// Structured rate-limit key builders.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitKey;

impl RateLimitKey {
    /// The engine-wide key used by the global limiter.
    pub const GLOBAL: &'static str = "global";

    /// Key for a queue's ingress limit.
    #[must_use]
    pub fn queue(name: &str) -> String {
        format!("queue:{name}")
    }

    /// Key for a per-user limit, optionally scoped to an endpoint.
    #[must_use]
    pub fn user(id: &str, endpoint: Option<&str>) -> String {
        match endpoint {
            Some(endpoint) => format!("user:{id}:{endpoint}"),
            None => format!("user:{id}"),
        }
    }

    /// Key for a per-address limit, optionally scoped to an endpoint.
    #[must_use]
    pub fn ip(addr: &str, endpoint: Option<&str>) -> String {
        match endpoint {
            Some(endpoint) => format!("ip:{addr}:{endpoint}"),
            None => format!("ip:{addr}"),
        }
    }

    /// Key for a specific processor within a queue.
    #[must_use]
    pub fn processor(queue: &str, name: &str) -> String {
        format!("processor:{queue}:{name}")
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// Counter value after this check's increment.
    pub count: u64,
    /// The configured limit.
    pub limit: u32,
    /// Absolute instant the current window expires.
    pub reset_time: DateTime<Utc>,
    /// Requests left in the window.
    pub remaining: u32,
}

/// Current state of a window, read without incrementing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Increments recorded in the window so far.
    pub count: u64,
    /// The configured limit.
    pub limit: u32,
    /// Absolute instant the window expires.
    pub reset_time: DateTime<Utc>,
    /// Requests left in the window.
    pub remaining: u32,
}

/// Storage-backed fixed-window rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn StorageAdapter>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &"<StorageAdapter>")
            .finish()
    }
}

impl RateLimiter {
    /// Creates a limiter over the given storage adapter.
    #[must_use]
    pub fn new(store: Arc<dyn StorageAdapter>) -> Self {
        Self { store }
    }

    /// Consumes one request under `key` and reports the decision.
    ///
    /// - `max_requests == 0` denies without touching storage (no window
    ///   is created)
    /// - otherwise the adapter's atomic increment is consulted; the
    ///   returned count reflects the counter after the increment and
    ///   `allowed == (count <= max_requests)`
    /// - once a window is open its `reset_time` is never extended by
    ///   later increments
    ///
    /// # Errors
    ///
    /// Returns a `Backend`-kind error when the adapter fails.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision> {
        if config.max_requests == 0 {
            return Ok(RateLimitDecision {
                allowed: false,
                count: 0,
                limit: 0,
                reset_time: Utc::now(),
                remaining: 0,
            });
        }

        let increment = self
            .store
            .increment_rate_limit(key, config.window, config.max_requests)
            .await?;

        Ok(RateLimitDecision {
            allowed: increment.allowed,
            count: increment.count,
            limit: config.max_requests,
            reset_time: increment.reset_time,
            remaining: remaining(config.max_requests, increment.count),
        })
    }

    /// Reads the current window under `key` without incrementing.
    ///
    /// Returns `None` when no live window exists.
    ///
    /// # Errors
    ///
    /// Returns a `Backend`-kind error when the adapter fails.
    pub async fn get_status(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<Option<RateLimitStatus>> {
        let Some(window) = self.store.get_rate_limit(key).await? else {
            return Ok(None);
        };

        Ok(Some(RateLimitStatus {
            count: window.count,
            limit: config.max_requests,
            reset_time: window.reset_time,
            remaining: remaining(config.max_requests, window.count),
        }))
    }

    /// Drops the window under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns a `Backend`-kind error when the adapter fails.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete_rate_limit(key).await
    }
}

fn remaining(limit: u32, count: u64) -> u32 {
    u64::from(limit)
        .saturating_sub(count)
        .try_into()
        .unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use std::time::Duration;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn keys_use_structured_prefixes() {
        assert_eq!(RateLimitKey::queue("emails"), "queue:emails");
        assert_eq!(RateLimitKey::user("u1", None), "user:u1");
        assert_eq!(
            RateLimitKey::user("u1", Some("send")),
            "user:u1:send"
        );
        assert_eq!(RateLimitKey::ip("10.0.0.1", None), "ip:10.0.0.1");
        assert_eq!(
            RateLimitKey::processor("emails", "welcome"),
            "processor:emails:welcome"
        );
    }

    #[tokio::test]
    async fn allows_within_limit_and_counts_down_remaining() -> Result<()> {
        let limiter = limiter();
        let config = RateLimitConfig::new(3, Duration::from_secs(60));

        for expected_count in 1..=3u64 {
            let decision = limiter.check_rate_limit("queue:emails", &config).await?;
            assert!(decision.allowed);
            assert_eq!(decision.count, expected_count);
            assert_eq!(decision.limit, 3);
            assert_eq!(u64::from(decision.remaining), 3 - expected_count);
        }

        let denied = limiter.check_rate_limit("queue:emails", &config).await?;
        assert!(!denied.allowed);
        assert_eq!(denied.count, 4);
        assert_eq!(denied.remaining, 0);

        Ok(())
    }

    #[tokio::test]
    async fn zero_limit_denies_without_opening_window() -> Result<()> {
        let limiter = limiter();
        let config = RateLimitConfig::new(0, Duration::from_secs(60));

        let decision = limiter.check_rate_limit("queue:emails", &config).await?;
        assert!(!decision.allowed);
        assert_eq!(decision.count, 0);

        // No window was created.
        let status = limiter.get_status("queue:emails", &config).await?;
        assert!(status.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn reset_time_is_fixed_within_a_window() -> Result<()> {
        let limiter = limiter();
        let config = RateLimitConfig::new(10, Duration::from_secs(60));

        let first = limiter.check_rate_limit("k", &config).await?;
        let second = limiter.check_rate_limit("k", &config).await?;
        assert_eq!(first.reset_time, second.reset_time);

        Ok(())
    }

    #[tokio::test]
    async fn status_reads_without_incrementing() -> Result<()> {
        let limiter = limiter();
        let config = RateLimitConfig::new(5, Duration::from_secs(60));

        assert!(limiter.get_status("k", &config).await?.is_none());

        limiter.check_rate_limit("k", &config).await?;
        let status = limiter
            .get_status("k", &config)
            .await?
            .expect("window is live");
        assert_eq!(status.count, 1);
        assert_eq!(status.remaining, 4);

        // Reading again does not consume quota.
        let status = limiter
            .get_status("k", &config)
            .await?
            .expect("window is live");
        assert_eq!(status.count, 1);

        Ok(())
    }

    #[tokio::test]
    async fn reset_drops_window() -> Result<()> {
        let limiter = limiter();
        let config = RateLimitConfig::new(1, Duration::from_secs(60));

        limiter.check_rate_limit("k", &config).await?;
        limiter.reset("k").await?;

        let decision = limiter.check_rate_limit("k", &config).await?;
        assert!(decision.allowed);
        assert_eq!(decision.count, 1);

        Ok(())
    }
}
