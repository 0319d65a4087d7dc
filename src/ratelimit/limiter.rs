//! Core rate limiter implementation.
//!
//! The limiter holds no per-key state of its own. Every check is one store
//! transaction, so any number of instances sharing a store enforce a single
//! quota per key.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::key::RateLimitKey;
use super::policy::{PolicyRegistry, RateLimitPolicy};
use super::window::{self, Decision, RateLimitEntry};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError};
use crate::store::{QuotaStore, STORE_LOG_TARGET};

/// Upper bound on a single check-and-consume transaction.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(2);

/// The core rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter<S: QuotaStore> {
    /// Shared quota store
    store: Arc<S>,
    /// Policies by limit type
    policies: Arc<PolicyRegistry>,
    /// Time source for window arithmetic
    clock: Arc<dyn Clock>,
    /// Bound applied to each store transaction
    transaction_timeout: Duration,
}

impl<S: QuotaStore> RateLimiter<S> {
    /// Create a new rate limiter using the system clock.
    pub fn new(store: Arc<S>, policies: PolicyRegistry) -> Self {
        Self {
            store,
            policies: Arc::new(policies),
            clock: Arc::new(SystemClock),
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Resolve the policy for a limit type.
    pub fn policy(&self, limit_type: &str) -> Result<&RateLimitPolicy> {
        self.policies.resolve(limit_type)
    }

    /// Check and consume quota for an identifier under a named limit type.
    ///
    /// Fails only with `UnknownPolicy`; store failures become a decision.
    pub async fn check(&self, identifier: &str, limit_type: &str) -> Result<Decision> {
        let policy = *self.policy(limit_type)?;
        let key = RateLimitKey::new(limit_type, identifier);
        Ok(self.check_and_consume(&key, &policy).await)
    }

    /// Check and consume one unit of quota for a key.
    ///
    /// Runs as a single store transaction bounded by the transaction timeout.
    /// Any store failure, including the timeout, is logged and turned into an
    /// allow (or a deny for fail-closed policies); it never reaches the caller.
    pub async fn check_and_consume(&self, key: &RateLimitKey, policy: &RateLimitPolicy) -> Decision {
        let now = self.clock.now();

        trace!(key = %key, quota = policy.quota, "Checking rate limit");

        let evaluate = |entry: Option<&RateLimitEntry>| window::evaluate(entry, policy, now);
        let transaction = self.store.check_and_consume(key, &evaluate);

        let outcome = match tokio::time::timeout(self.transaction_timeout, transaction).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::TransactionTimeout(self.transaction_timeout)),
        };

        match outcome {
            Ok(decision) => {
                if decision.allowed {
                    trace!(key = %key, remaining = decision.remaining, "Rate limit check passed");
                } else {
                    debug!(
                        key = %key,
                        limit = decision.limit,
                        reset_at = %decision.reset_at,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(err) => self.degrade(key, policy, now, &err),
        }
    }

    fn degrade(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitPolicy,
        now: chrono::DateTime<chrono::Utc>,
        err: &StoreError,
    ) -> Decision {
        if policy.fail_closed {
            warn!(
                target: STORE_LOG_TARGET,
                limit_type = %key.limit_type,
                identifier = %key.identifier,
                error = %err,
                "Quota store failed, denying under fail-closed policy"
            );
            Decision::fail_closed(policy, now)
        } else {
            warn!(
                target: STORE_LOG_TARGET,
                limit_type = %key.limit_type,
                identifier = %key.identifier,
                error = %err,
                "Quota store failed, failing open"
            );
            Decision::fail_open(policy, now)
        }
    }

    /// Delete the stored entry for an identifier and limit type.
    ///
    /// Returns whether an entry existed. Deleting a missing entry is not an error.
    pub async fn reset_rate_limit(&self, identifier: &str, limit_type: &str) -> Result<bool> {
        let key = RateLimitKey::new(limit_type, identifier);
        let removed = self.store.delete(&key).await?;
        debug!(key = %key, removed, "Rate limit reset");
        Ok(removed)
    }

    /// Read the stored entry for an identifier and limit type.
    pub async fn read_entry(
        &self,
        identifier: &str,
        limit_type: &str,
    ) -> Result<Option<RateLimitEntry>> {
        let key = RateLimitKey::new(limit_type, identifier);
        Ok(self.store.read(&key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::QuotaError;
    use crate::store::test_support::{StallingStore, UnavailableStore};
    use crate::store::MemoryStore;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ))
    }

    fn test_limiter(policy: RateLimitPolicy) -> (RateLimiter<MemoryStore>, Arc<ManualClock>) {
        let clock = test_clock();
        let policies = PolicyRegistry::empty().with_policy("test", policy).unwrap();
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), policies)
            .with_clock(clock.clone());
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_quota_counts_down() {
        let (limiter, _clock) = test_limiter(RateLimitPolicy::new(5, 60));

        for expected in (0..5).rev() {
            let decision = limiter.check("user:1", "test").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.limit, 5);
        }

        let decision = limiter.check("user:1", "test").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after_secs.is_some());
    }

    #[tokio::test]
    async fn test_block_escalation_example() {
        let (limiter, clock) = test_limiter(RateLimitPolicy::new(5, 60).with_block(60));
        let start = clock.now();

        for expected in [4, 3, 2, 1, 0] {
            let decision = limiter.check("user:k", "test").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            clock.advance_secs(1);
        }

        let denied = limiter.check("user:k", "test").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, Some(60));
        assert_eq!(denied.reset_at, clock.now() + ChronoDuration::seconds(60));

        clock.set(start + ChronoDuration::seconds(70));
        let allowed = limiter.check("user:k", "test").await.unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 4);
    }

    #[tokio::test]
    async fn test_window_elapse_resets_count() {
        let (limiter, clock) = test_limiter(RateLimitPolicy::new(2, 60));

        limiter.check("user:1", "test").await.unwrap();
        limiter.check("user:1", "test").await.unwrap();
        assert!(!limiter.check("user:1", "test").await.unwrap().allowed);

        clock.advance_secs(61);
        let decision = limiter.check("user:1", "test").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);

        let entry = limiter.read_entry("user:1", "test").await.unwrap().unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.window_start, clock.now());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_never_exceed_quota() {
        let (limiter, _clock) = test_limiter(RateLimitPolicy::new(10, 60));
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("ip:shared", "test").await.unwrap() })
            })
            .collect();

        let mut allowed = 0;
        let mut denied = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            } else {
                denied += 1;
            }
        }

        assert_eq!(allowed, 10);
        assert_eq!(denied, 40);
    }

    #[tokio::test]
    async fn test_reset_behaves_like_new_key() {
        let (limiter, _clock) = test_limiter(RateLimitPolicy::new(3, 60).with_block(300));

        for _ in 0..4 {
            limiter.check("user:9", "test").await.unwrap();
        }
        assert!(!limiter.check("user:9", "test").await.unwrap().allowed);

        assert!(limiter.reset_rate_limit("user:9", "test").await.unwrap());
        assert!(!limiter.reset_rate_limit("user:9", "test").await.unwrap());

        let fresh = limiter.check("user:9", "test").await.unwrap();
        let never_seen = limiter.check("user:other", "test").await.unwrap();
        assert_eq!(fresh, never_seen);
        assert_eq!(fresh.remaining, 2);
    }

    #[tokio::test]
    async fn test_limit_types_are_independent() {
        let clock = test_clock();
        let policies = PolicyRegistry::empty()
            .with_policy("a", RateLimitPolicy::new(1, 60))
            .unwrap()
            .with_policy("b", RateLimitPolicy::new(1, 60))
            .unwrap();
        let limiter =
            RateLimiter::new(Arc::new(MemoryStore::new()), policies).with_clock(clock);

        assert!(limiter.check("user:1", "a").await.unwrap().allowed);
        assert!(limiter.check("user:1", "b").await.unwrap().allowed);
        assert!(!limiter.check("user:1", "a").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unknown_policy_propagates() {
        let (limiter, _clock) = test_limiter(RateLimitPolicy::new(1, 60));
        let result = limiter.check("user:1", "missing").await;
        assert!(matches!(result, Err(QuotaError::UnknownPolicy(_))));
    }

    #[tokio::test]
    async fn test_store_unavailable_fails_open() {
        let clock = test_clock();
        let policies = PolicyRegistry::empty()
            .with_policy("test", RateLimitPolicy::new(5, 60))
            .unwrap();
        let limiter =
            RateLimiter::new(Arc::new(UnavailableStore), policies).with_clock(clock.clone());

        let decision = limiter.check("user:1", "test").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert_eq!(decision.reset_at, clock.now() + ChronoDuration::seconds(60));
        assert_eq!(decision.retry_after_secs, None);
    }

    #[tokio::test]
    async fn test_store_timeout_fails_open() {
        let policies = PolicyRegistry::empty()
            .with_policy("test", RateLimitPolicy::new(5, 60))
            .unwrap();
        let limiter = RateLimiter::new(Arc::new(StallingStore), policies)
            .with_transaction_timeout(Duration::from_millis(20));

        let decision = limiter.check("user:1", "test").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
    }

    #[tokio::test]
    async fn test_fail_closed_policy_denies_on_store_failure() {
        let policies = PolicyRegistry::empty()
            .with_policy(
                "login",
                RateLimitPolicy::new(5, 60).with_fail_closed(true),
            )
            .unwrap();
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), policies);

        let decision = limiter.check("ip:abc", "login").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn test_reset_surfaces_store_errors() {
        let limiter = RateLimiter::new(Arc::new(UnavailableStore), PolicyRegistry::builtin());
        let result = limiter.reset_rate_limit("user:1", "general").await;
        assert!(matches!(result, Err(QuotaError::Store(StoreError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn test_oversized_window_is_rejected_up_front() {
        let registered = PolicyRegistry::empty()
            .with_policy("huge", RateLimitPolicy::new(1, 10_000_000_000_000));
        assert!(matches!(registered, Err(QuotaError::InvalidPolicy { .. })));

        // A policy built by hand still produces decisions rather than panicking
        let (limiter, _clock) = test_limiter(RateLimitPolicy::new(1, 60));
        let policy = RateLimitPolicy::new(1, 10_000_000_000_000);
        let key = RateLimitKey::new("huge", "user:1");

        assert!(limiter.check_and_consume(&key, &policy).await.allowed);
        assert!(!limiter.check_and_consume(&key, &policy).await.allowed);
    }
}
