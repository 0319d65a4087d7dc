//! Removal of stale rate limit entries.
//!
//! Entries are only ever deleted here after a long retention horizon. Whether
//! a window or block has expired is decided by the limiter when the key is
//! next used, never by this job. The horizon is never shorter than the
//! longest policy window, so a window still in progress is never dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{QuotaStore, STORE_LOG_TARGET};

/// Hours of inactivity after which an entry may be deleted.
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Maximum entries deleted by one cleanup call.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Periodic cleanup of inactive entries.
pub struct MaintenanceJob<S: QuotaStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    /// Longest window among the policies writing to the store
    longest_window: chrono::Duration,
    batch_size: usize,
}

impl<S: QuotaStore> MaintenanceJob<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retention: chrono::Duration::hours(DEFAULT_RETENTION_HOURS),
            longest_window: chrono::Duration::zero(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Create a job working on the same store and clock as a limiter.
    ///
    /// The horizon is widened to cover the limiter's longest policy window.
    pub fn for_limiter(limiter: &RateLimiter<S>) -> Self {
        Self::new(limiter.store().clone(), limiter.clock().clone())
            .covering_window(limiter.policies().longest_window())
    }

    /// Keep entries at least as long as `window`.
    pub fn covering_window(mut self, window: chrono::Duration) -> Self {
        self.longest_window = self.longest_window.max(window);
        self
    }

    /// Inactivity after which an entry may be deleted.
    pub fn horizon(&self) -> chrono::Duration {
        self.retention.max(self.longest_window)
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Delete one batch of entries inactive for longer than the retention horizon.
    ///
    /// Returns the number removed; `0` once nothing stale remains. Safe to run
    /// concurrently with itself and with live traffic.
    pub async fn cleanup(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let cutoff = now
            .checked_sub_signed(self.horizon())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.delete_older_than(cutoff, self.batch_size).await?;

        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Removed stale rate limit entries");
        } else {
            debug!(cutoff = %cutoff, "No stale rate limit entries");
        }
        Ok(removed)
    }

    /// Run `cleanup` every `interval` until the returned task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()>
    where
        S: 'static,
    {
        info!(interval = ?interval, "Starting rate limit cleanup task");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if let Err(err) = self.cleanup().await {
                    warn!(
                        target: STORE_LOG_TARGET,
                        error = %err,
                        "Rate limit cleanup failed"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{PolicyRegistry, RateLimitEntry, RateLimitKey, RateLimitPolicy};
    use crate::store::test_support::UnavailableStore;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, MaintenanceJob<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        ));
        let job = MaintenanceJob::new(store.clone(), clock.clone());
        (store, clock, job)
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_expired_entries() {
        let (store, clock, job) = setup();
        let policies = PolicyRegistry::empty()
            .with_policy("test", RateLimitPolicy::new(1, 60).with_block(60))
            .unwrap();
        let limiter = RateLimiter::new(store.clone(), policies).with_clock(clock.clone());

        limiter.check("user:1", "test").await.unwrap();
        limiter.check("user:1", "test").await.unwrap();

        // Window and block are long over, but the entry is within retention
        clock.advance_secs(23 * 3600);
        assert_eq!(job.cleanup().await.unwrap(), 0);
        assert_eq!(store.len(), 1);

        clock.advance_secs(2 * 3600);
        assert_eq!(job.cleanup().await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_batched() {
        let (store, clock, job) = setup();
        let job = job.with_batch_size(2);
        let old = clock.now() - chrono::Duration::hours(30);
        for i in 0..5 {
            store.insert(
                RateLimitKey::new("general", &format!("ip:{}", i)),
                RateLimitEntry::first_call(old),
            );
        }

        assert_eq!(job.cleanup().await.unwrap(), 2);
        assert_eq!(job.cleanup().await.unwrap(), 2);
        assert_eq!(job.cleanup().await.unwrap(), 1);
        assert_eq!(job.cleanup().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_cleanup_removes_each_entry_once() {
        let (store, clock, job) = setup();
        let job = Arc::new(job.with_batch_size(1000));
        let old = clock.now() - chrono::Duration::hours(48);
        for i in 0..200 {
            store.insert(
                RateLimitKey::new("general", &format!("ip:{}", i)),
                RateLimitEntry::first_call(old),
            );
        }

        let (a, b) = tokio::join!(
            {
                let job = job.clone();
                async move { job.cleanup().await.unwrap() }
            },
            {
                let job = job.clone();
                async move { job.cleanup().await.unwrap() }
            }
        );

        assert_eq!(a + b, 200);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_reports_store_errors() {
        let job = MaintenanceJob::new(Arc::new(UnavailableStore), Arc::new(ManualClock::default()));
        assert!(matches!(job.cleanup().await, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_spawned_task_cleans_up() {
        let (store, clock, job) = setup();
        store.insert(
            RateLimitKey::new("general", "ip:old"),
            RateLimitEntry::first_call(clock.now() - chrono::Duration::hours(25)),
        );

        let handle = Arc::new(job).spawn(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_windows_longer_than_retention() {
        let (store, clock, _) = setup();
        let policies = PolicyRegistry::empty()
            .with_policy("daily", RateLimitPolicy::new(2, 48 * 3600))
            .unwrap();
        let limiter = RateLimiter::new(store.clone(), policies).with_clock(clock.clone());
        let job = MaintenanceJob::for_limiter(&limiter);
        assert_eq!(job.horizon(), chrono::Duration::hours(48));

        let mut allowed = 0;
        for _ in 0..3 {
            if limiter.check("user:1", "daily").await.unwrap().allowed {
                allowed += 1;
            }
        }

        // Past the default retention but inside the window
        clock.advance_secs(25 * 3600);
        assert_eq!(job.cleanup().await.unwrap(), 0);

        for _ in 0..3 {
            if limiter.check("user:1", "daily").await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 2);

        clock.advance_secs(24 * 3600);
        assert_eq!(job.cleanup().await.unwrap(), 1);
    }

    #[test]
    fn test_horizon_is_at_least_retention() {
        let (_, _, job) = setup();
        let job = job.covering_window(chrono::Duration::minutes(5));
        assert_eq!(job.horizon(), chrono::Duration::hours(DEFAULT_RETENTION_HOURS));

        let job = job.with_retention(chrono::Duration::hours(1));
        assert_eq!(job.horizon(), chrono::Duration::hours(1));

        let job = job.covering_window(chrono::Duration::hours(3));
        assert_eq!(job.horizon(), chrono::Duration::hours(3));
    }
}
