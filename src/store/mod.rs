//! Quota store adapters.
//!
//! A store keeps one `RateLimitEntry` per key and must be able to run the
//! limiter's evaluation as a single atomic read-evaluate-write for that key.
//! Nothing here caches entries on the client side: every check goes to the
//! store, which is what keeps the count correct across instances.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::ratelimit::{Decision, Evaluation, RateLimitEntry, RateLimitKey};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Log target for store failures, kept apart from adapter failures.
pub const STORE_LOG_TARGET: &str = "quotagate::store";

/// Evaluation run inside a store transaction.
///
/// It may be invoked more than once when a store retries on conflict, so it
/// must be free of side effects.
pub type EvaluateFn<'a> = dyn Fn(Option<&RateLimitEntry>) -> Evaluation + Send + Sync + 'a;

/// Trait for quota store implementations.
///
/// Any store offering atomic single-key transactions and batched range
/// deletes can back the limiter. "Not found" is never an error: reads return
/// `Ok(None)` and deletes of missing keys return `Ok(false)`.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Atomically read the entry for `key`, evaluate it and persist the result.
    ///
    /// Concurrent calls for the same key must be serialized; lost updates
    /// are not acceptable.
    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        evaluate: &EvaluateFn<'_>,
    ) -> Result<Decision, StoreError>;

    /// Read the entry for a key.
    async fn read(&self, key: &RateLimitKey) -> Result<Option<RateLimitEntry>, StoreError>;

    /// Delete the entry for a key, returning whether one existed.
    async fn delete(&self, key: &RateLimitKey) -> Result<bool, StoreError>;

    /// Delete at most `limit` entries that have been inactive since `cutoff`.
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError>;
}

/// Whether an entry has seen no activity since `cutoff`.
///
/// A window started before the cutoff is not enough on its own: a block
/// reaching past the cutoff keeps the entry alive.
pub(crate) fn inactive_since(entry: &RateLimitEntry, cutoff: DateTime<Utc>) -> bool {
    entry.window_start < cutoff && entry.blocked_until.map_or(true, |until| until < cutoff)
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_inactive_since() {
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let old = RateLimitEntry::first_call(cutoff - Duration::hours(1));
        assert!(inactive_since(&old, cutoff));

        let fresh = RateLimitEntry::first_call(cutoff + Duration::seconds(1));
        assert!(!inactive_since(&fresh, cutoff));

        let blocked = RateLimitEntry {
            blocked_until: Some(cutoff + Duration::hours(2)),
            ..old
        };
        assert!(!inactive_since(&blocked, cutoff));

        let block_ended = RateLimitEntry {
            blocked_until: Some(cutoff - Duration::minutes(5)),
            ..old
        };
        assert!(inactive_since(&block_ended, cutoff));
    }
}
