//! Fixed-window quota state and its evaluation.
//!
//! `evaluate` is the decision half of check-and-consume. It is pure: given the
//! stored entry (if any), the policy and the current time it returns the
//! decision and the entry to write back. Stores run it inside their per-key
//! transaction so the read, the decision and the write are indivisible.

use chrono::{DateTime, Utc};

use super::policy::RateLimitPolicy;

/// Stored quota state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Calls counted in the current window
    pub count: u32,
    /// When the current window started
    pub window_start: DateTime<Utc>,
    /// Hard-block deadline; the key is denied until then
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitEntry {
    /// Entry for the first call of a new window.
    pub fn first_call(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            window_start: now,
            blocked_until: None,
        }
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    /// Whether the window this entry counts against has elapsed.
    pub fn window_elapsed(&self, policy: &RateLimitPolicy, now: DateTime<Utc>) -> bool {
        self.window_start < earlier(now, policy.window())
    }

    pub fn window_end(&self, policy: &RateLimitPolicy) -> DateTime<Utc> {
        later(self.window_start, policy.window())
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the call may proceed
    pub allowed: bool,
    /// The policy quota
    pub limit: u32,
    /// Calls still allowed in the current window
    pub remaining: u32,
    /// When the caller's quota next becomes available
    pub reset_at: DateTime<Utc>,
    /// Seconds to wait before retrying, set on deny
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    fn allow(limit: u32, remaining: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after_secs: None,
        }
    }

    fn deny(limit: u32, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after_secs: Some(retry_after(reset_at, now)),
        }
    }

    /// Decision used when the store cannot be consulted and the policy fails open.
    pub fn fail_open(policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        Self::allow(policy.quota, policy.quota, later(now, policy.window()))
    }

    /// Decision used when the store cannot be consulted and the policy fails closed.
    pub fn fail_closed(policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        Self::deny(policy.quota, later(now, policy.window()), now)
    }
}

/// A decision plus the entry to persist, if the state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub write: Option<RateLimitEntry>,
}

/// Apply one call to the stored state.
pub fn evaluate(
    entry: Option<&RateLimitEntry>,
    policy: &RateLimitPolicy,
    now: DateTime<Utc>,
) -> Evaluation {
    let quota = policy.quota;

    // Hard block wins over everything else
    if let Some(until) = entry
        .filter(|e| e.is_blocked(now))
        .and_then(|e| e.blocked_until)
    {
        return Evaluation {
            decision: Decision::deny(quota, until, now),
            write: None,
        };
    }

    let entry = match entry {
        Some(entry) if !entry.window_elapsed(policy, now) => entry,
        _ => {
            return Evaluation {
                decision: Decision::allow(
                    quota,
                    quota.saturating_sub(1),
                    later(now, policy.window()),
                ),
                write: Some(RateLimitEntry::first_call(now)),
            };
        }
    };

    if entry.count >= quota {
        return match policy.block() {
            Some(block) => {
                let until = later(now, block);
                Evaluation {
                    decision: Decision::deny(quota, until, now),
                    write: Some(RateLimitEntry {
                        blocked_until: Some(until),
                        ..*entry
                    }),
                }
            }
            None => Evaluation {
                decision: Decision::deny(quota, entry.window_end(policy), now),
                write: None,
            },
        };
    }

    Evaluation {
        decision: Decision::allow(
            quota,
            quota.saturating_sub(entry.count + 1),
            entry.window_end(policy),
        ),
        write: Some(RateLimitEntry {
            count: entry.count + 1,
            ..*entry
        }),
    }
}

/// `at + by`, clamped to the latest representable time.
fn later(at: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - by`, clamped to the earliest representable time.
fn earlier(at: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
    at.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Whole seconds until `reset_at`, rounded up, never below one.
fn retry_after(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}
