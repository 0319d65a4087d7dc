//! Rate limit policy registry.
//!
//! A policy is the quota, window length and optional hard-block length that
//! applies to one limit type. The registry is built once at startup from the
//! built-in table plus configured overrides and is read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{QuotaError, Result};

/// Limit type used when a caller does not name one.
pub const DEFAULT_LIMIT_TYPE: &str = "general";

/// Largest quota a policy may use; counts are stored as 32-bit signed integers.
pub const MAX_QUOTA: u32 = i32::MAX as u32;

/// Longest window or block a policy may use (ten years).
pub const MAX_DURATION_SECONDS: u64 = 10 * 365 * 24 * 3600;

/// Convert whole seconds, saturating instead of overflowing.
fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Quota configuration for one limit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Calls allowed per window
    pub quota: u32,
    /// Length of the fixed window in seconds
    pub window_seconds: u64,
    /// Hard-block length applied once the quota is exceeded
    #[serde(default)]
    pub block_seconds: Option<u64>,
    /// Deny instead of allow when the store cannot be consulted
    #[serde(default)]
    pub fail_closed: bool,
}

impl RateLimitPolicy {
    /// Create a fail-open policy without hard blocking.
    pub const fn new(quota: u32, window_seconds: u64) -> Self {
        Self {
            quota,
            window_seconds,
            block_seconds: None,
            fail_closed: false,
        }
    }

    /// Escalate to a hard block of `block_seconds` once the quota is exceeded.
    pub const fn with_block(mut self, block_seconds: u64) -> Self {
        self.block_seconds = Some(block_seconds);
        self
    }

    pub const fn with_fail_closed(mut self, fail_closed: bool) -> Self {
        self.fail_closed = fail_closed;
        self
    }

    pub fn window(&self) -> chrono::Duration {
        seconds(self.window_seconds)
    }

    pub fn block(&self) -> Option<chrono::Duration> {
        self.block_seconds.map(seconds)
    }

    /// Check that every configured quantity is positive and within bounds.
    pub fn validate(&self, limit_type: &str) -> Result<()> {
        let invalid = |reason: &str| QuotaError::InvalidPolicy {
            limit_type: limit_type.to_string(),
            reason: reason.to_string(),
        };

        if self.quota == 0 {
            return Err(invalid("quota must be positive"));
        }
        if self.window_seconds == 0 {
            return Err(invalid("window_seconds must be positive"));
        }
        if self.block_seconds == Some(0) {
            return Err(invalid("block_seconds must be positive when set"));
        }
        if self.quota > MAX_QUOTA {
            return Err(invalid("quota exceeds 2147483647"));
        }
        if self.window_seconds > MAX_DURATION_SECONDS {
            return Err(invalid("window_seconds exceeds ten years"));
        }
        if self.block_seconds.is_some_and(|secs| secs > MAX_DURATION_SECONDS) {
            return Err(invalid("block_seconds exceeds ten years"));
        }
        Ok(())
    }
}

/// On-disk form of a policy table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PolicyFile {
    policies: HashMap<String, RateLimitPolicy>,
}

/// Table of policies keyed by limit type.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, RateLimitPolicy>,
}

impl PolicyRegistry {
    /// Create a registry with no policies.
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    /// Create a registry holding the built-in policy table.
    pub fn builtin() -> Self {
        let mut policies = HashMap::new();
        policies.insert(DEFAULT_LIMIT_TYPE.to_string(), RateLimitPolicy::new(100, 60));
        policies.insert("api".to_string(), RateLimitPolicy::new(60, 60));
        policies.insert(
            "auth".to_string(),
            RateLimitPolicy::new(5, 300).with_block(900),
        );
        policies.insert("generation".to_string(), RateLimitPolicy::new(10, 60));
        Self { policies }
    }

    /// Register (or replace) the policy for a limit type.
    pub fn with_policy(mut self, limit_type: &str, policy: RateLimitPolicy) -> Result<Self> {
        self.insert(limit_type, policy)?;
        Ok(self)
    }

    pub fn insert(&mut self, limit_type: &str, policy: RateLimitPolicy) -> Result<()> {
        if limit_type.trim().is_empty() {
            return Err(QuotaError::InvalidPolicy {
                limit_type: limit_type.to_string(),
                reason: "limit type must not be empty".to_string(),
            });
        }
        policy.validate(limit_type)?;
        self.policies.insert(limit_type.to_string(), policy);
        Ok(())
    }

    /// Merge a set of policies over the current table.
    pub fn extend<I>(&mut self, policies: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, RateLimitPolicy)>,
    {
        for (limit_type, policy) in policies {
            self.insert(&limit_type, policy)?;
        }
        Ok(())
    }

    /// Load a policy table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy table from a YAML string.
    ///
    /// Accepts either a document with a top-level `policies` map or the bare map.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let policies = match serde_yaml::from_str::<PolicyFile>(yaml) {
            Ok(file) => file.policies,
            Err(_) => serde_yaml::from_str::<HashMap<String, RateLimitPolicy>>(yaml).map_err(
                |e| QuotaError::Config(format!("Failed to parse rate limit policies: {}", e)),
            )?,
        };

        let mut registry = Self::empty();
        registry.extend(policies)?;
        Ok(registry)
    }

    /// Look up the policy for a limit type.
    pub fn resolve(&self, limit_type: &str) -> Result<&RateLimitPolicy> {
        self.policies
            .get(limit_type)
            .ok_or_else(|| QuotaError::UnknownPolicy(limit_type.to_string()))
    }

    pub fn contains(&self, limit_type: &str) -> bool {
        self.policies.contains_key(limit_type)
    }

    pub fn limit_types(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// The longest window of any registered policy, zero when empty.
    pub fn longest_window(&self) -> chrono::Duration {
        self.policies
            .values()
            .map(RateLimitPolicy::window)
            .max()
            .unwrap_or_else(chrono::Duration::zero)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
