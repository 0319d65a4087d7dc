//! PostgreSQL quota store.
//!
//! Check-and-consume locks the key's row with `SELECT ... FOR UPDATE` inside
//! a transaction. A key with no row cannot be locked, so two first calls may
//! both try to insert it; the loser hits the primary key, rolls back and
//! retries against the now-existing row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::{EvaluateFn, QuotaStore};
use crate::error::StoreError;
use crate::ratelimit::{Decision, RateLimitEntry, RateLimitKey};

/// Default number of attempts before a conflicting transaction is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Base delay for the jittered retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(5);

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rate_limit_entries (
    limit_type    TEXT        NOT NULL,
    identifier    TEXT        NOT NULL,
    count         INTEGER     NOT NULL,
    window_start  TIMESTAMPTZ NOT NULL,
    blocked_until TIMESTAMPTZ,
    PRIMARY KEY (limit_type, identifier)
)"#;

const CREATE_WINDOW_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS rate_limit_entries_window_start_idx
    ON rate_limit_entries (window_start)"#;

const SELECT_ENTRY: &str = r#"
SELECT count, window_start, blocked_until
FROM rate_limit_entries
WHERE limit_type = $1 AND identifier = $2"#;

const SELECT_ENTRY_FOR_UPDATE: &str = r#"
SELECT count, window_start, blocked_until
FROM rate_limit_entries
WHERE limit_type = $1 AND identifier = $2
FOR UPDATE"#;

const INSERT_ENTRY: &str = r#"
INSERT INTO rate_limit_entries (limit_type, identifier, count, window_start, blocked_until)
VALUES ($1, $2, $3, $4, $5)"#;

const UPDATE_ENTRY: &str = r#"
UPDATE rate_limit_entries
SET count = $3, window_start = $4, blocked_until = $5
WHERE limit_type = $1 AND identifier = $2"#;

const DELETE_ENTRY: &str = r#"
DELETE FROM rate_limit_entries
WHERE limit_type = $1 AND identifier = $2"#;

// Rows locked by live transactions are skipped, never waited on.
const DELETE_INACTIVE: &str = r#"
DELETE FROM rate_limit_entries
WHERE (limit_type, identifier) IN (
    SELECT limit_type, identifier
    FROM rate_limit_entries
    WHERE window_start < $1
      AND (blocked_until IS NULL OR blocked_until < $1)
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)"#;

/// Postgres error codes that mean "another transaction got there first".
const CONFLICT_CODES: [&str; 3] = [
    "23505", // unique_violation
    "40001", // serialization_failure
    "40P01", // deadlock_detected
];

type EntryRow = (i32, DateTime<Utc>, Option<DateTime<Utc>>);

fn entry_from_row((count, window_start, blocked_until): EntryRow) -> RateLimitEntry {
    RateLimitEntry {
        count: u32::try_from(count).unwrap_or(0),
        window_start,
        blocked_until,
    }
}

fn is_conflict(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| CONFLICT_CODES.iter().any(|known| *known == code))
}

/// Quota store backed by a PostgreSQL table.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    max_attempts: u32,
}

impl PostgresStore {
    /// Connect a new pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!(max_connections, "Connected to PostgreSQL quota store");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Bound the number of attempts for a conflicting transaction.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Create the entries table and its index if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_WINDOW_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    async fn try_check_and_consume(
        &self,
        key: &RateLimitKey,
        evaluate: &EvaluateFn<'_>,
    ) -> Result<Decision, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, EntryRow>(SELECT_ENTRY_FOR_UPDATE)
            .bind(&key.limit_type)
            .bind(&key.identifier)
            .fetch_optional(&mut *tx)
            .await?
            .map(entry_from_row);

        let evaluation = evaluate(current.as_ref());

        if let Some(write) = evaluation.write {
            let statement = if current.is_some() {
                UPDATE_ENTRY
            } else {
                INSERT_ENTRY
            };
            sqlx::query(statement)
                .bind(&key.limit_type)
                .bind(&key.identifier)
                .bind(i32::try_from(write.count).unwrap_or(i32::MAX))
                .bind(write.window_start)
                .bind(write.blocked_until)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(evaluation.decision)
    }
}

async fn backoff(attempt: u32) {
    let ceiling = RETRY_BASE_DELAY.as_millis() as u64 * 2u64.pow(attempt.min(6));
    let delay = rand::thread_rng().gen_range(0..=ceiling);
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

#[async_trait]
impl QuotaStore for PostgresStore {
    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        evaluate: &EvaluateFn<'_>,
    ) -> Result<Decision, StoreError> {
        for attempt in 1..=self.max_attempts {
            match self.try_check_and_consume(key, evaluate).await {
                Ok(decision) => return Ok(decision),
                Err(err) if is_conflict(&err) => {
                    debug!(
                        key = %key,
                        attempt,
                        error = %err,
                        "Check-and-consume conflicted, retrying"
                    );
                    if attempt < self.max_attempts {
                        backoff(attempt).await;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(StoreError::TransactionAborted {
            attempts: self.max_attempts,
        })
    }

    async fn read(&self, key: &RateLimitKey) -> Result<Option<RateLimitEntry>, StoreError> {
        let row = sqlx::query_as::<_, EntryRow>(SELECT_ENTRY)
            .bind(&key.limit_type)
            .bind(&key.identifier)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(entry_from_row))
    }

    async fn delete(&self, key: &RateLimitKey) -> Result<bool, StoreError> {
        let result = sqlx::query(DELETE_ENTRY)
            .bind(&key.limit_type)
            .bind(&key.identifier)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(DELETE_INACTIVE)
            .bind(cutoff)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
