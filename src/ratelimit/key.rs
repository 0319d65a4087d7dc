//! Rate limit key generation and handling.

/// A key that uniquely identifies one rate limit entry.
///
/// The same identifier is tracked independently per limit type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The limit type whose policy governs this entry
    pub limit_type: String,
    /// Caller identifier, `user:<id>` or `ip:<hash>`
    pub identifier: String,
}

impl RateLimitKey {
    /// Create a new rate limit key.
    pub fn new(limit_type: &str, identifier: &str) -> Self {
        Self {
            limit_type: limit_type.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Convert the key to its single-string storage form.
    ///
    /// Format: "{limit_type}|{identifier}".
    pub fn to_storage_key(&self) -> String {
        format!("{}|{}", self.limit_type, self.identifier)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}
