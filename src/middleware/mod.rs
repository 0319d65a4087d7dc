//! Request pipeline integration.
//!
//! `RateLimitLayer` wraps any `tower` service over `http` requests: it
//! resolves the caller, consults the limiter, annotates responses with quota
//! headers and answers exhausted callers with a 429 instead of invoking the
//! wrapped service.

mod layer;
mod messages;

pub use layer::{
    RateLimitLayer, RateLimitService, ADAPTER_LOG_TARGET, RATE_LIMIT_EXCEEDED,
    RATE_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER,
};
pub use messages::{rate_limit_message, Locale};
