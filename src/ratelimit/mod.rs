//! Rate limiting logic and state management.

mod identity;
mod key;
mod limiter;
mod maintenance;
mod policy;
mod window;

pub use identity::{
    AddressHasher, AuthenticatedPrincipal, Caller, CallerInfo, IdentityResolver,
    FORWARDED_FOR_HEADER,
};
pub use key::RateLimitKey;
pub use limiter::{RateLimiter, DEFAULT_TRANSACTION_TIMEOUT};
pub use maintenance::{MaintenanceJob, DEFAULT_BATCH_SIZE, DEFAULT_RETENTION_HOURS};
pub use policy::{
    PolicyRegistry, RateLimitPolicy, DEFAULT_LIMIT_TYPE, MAX_DURATION_SECONDS, MAX_QUOTA,
};
pub use window::{evaluate, Decision, Evaluation, RateLimitEntry};
