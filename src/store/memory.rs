//! Single-process quota store.
//!
//! Suitable for one instance, local development and tests. The evaluation
//! runs while the key's shard lock is held, which makes check-and-consume
//! serializable per key without any retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{inactive_since, EvaluateFn, QuotaStore};
use crate::error::StoreError;
use crate::ratelimit::{Decision, RateLimitEntry, RateLimitKey};

/// In-memory store keyed by rate limit key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<RateLimitKey, RateLimitEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write an entry directly, bypassing evaluation.
    pub fn insert(&self, key: RateLimitKey, entry: RateLimitEntry) {
        self.entries.insert(key, entry);
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        evaluate: &EvaluateFn<'_>,
    ) -> Result<Decision, StoreError> {
        let evaluation = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let evaluation = evaluate(Some(occupied.get()));
                if let Some(write) = evaluation.write {
                    *occupied.get_mut() = write;
                }
                evaluation
            }
            Entry::Vacant(vacant) => {
                let evaluation = evaluate(None);
                if let Some(write) = evaluation.write {
                    vacant.insert(write);
                }
                evaluation
            }
        };

        trace!(
            key = %key,
            allowed = evaluation.decision.allowed,
            written = evaluation.write.is_some(),
            "Applied check-and-consume"
        );

        Ok(evaluation.decision)
    }

    async fn read(&self, key: &RateLimitKey) -> Result<Option<RateLimitEntry>, StoreError> {
        Ok(self.entries.get(key).map(|entry| *entry.value()))
    }

    async fn delete(&self, key: &RateLimitKey) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let candidates: Vec<RateLimitKey> = self
            .entries
            .iter()
            .filter(|item| inactive_since(item.value(), cutoff))
            .map(|item| item.key().clone())
            .take(limit)
            .collect();

        // Re-check under the shard lock: the entry may have been touched
        // since the scan.
        let removed = candidates
            .iter()
            .filter(|key| {
                self.entries
                    .remove_if(*key, |_, entry| inactive_since(entry, cutoff))
                    .is_some()
            })
            .count();

        Ok(removed)
    }
}
