//! Quota service implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::quotagate::v1::{
    quota_service_server::QuotaService, CheckAndConsumeRequest, CheckAndConsumeResponse,
    CleanupExpiredRequest, CleanupExpiredResponse, ResetRateLimitRequest, ResetRateLimitResponse,
};
use super::proto::quotagate::v1::Caller as ProtoCaller;
use crate::ratelimit::{
    Caller, IdentityResolver, MaintenanceJob, RateLimitKey, RateLimiter, DEFAULT_LIMIT_TYPE,
};
use crate::store::QuotaStore;

impl From<ProtoCaller> for Caller {
    fn from(caller: ProtoCaller) -> Self {
        let present = |value: String| Some(value).filter(|v| !v.trim().is_empty());
        Caller {
            principal_id: present(caller.principal_id),
            forwarded_for: present(caller.forwarded_for),
            remote_addr: present(caller.remote_addr),
        }
    }
}

fn to_timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

/// Implementation of the `quotagate.v1.QuotaService` gRPC interface.
pub struct QuotaServiceImpl<S: QuotaStore> {
    /// The rate limiter instance
    limiter: Arc<RateLimiter<S>>,
    /// Resolves callers that arrive without an identifier
    resolver: Arc<IdentityResolver>,
    /// Cleanup job sharing the limiter's store
    maintenance: Arc<MaintenanceJob<S>>,
}

impl<S: QuotaStore> QuotaServiceImpl<S> {
    pub fn new(
        limiter: Arc<RateLimiter<S>>,
        resolver: Arc<IdentityResolver>,
        maintenance: Arc<MaintenanceJob<S>>,
    ) -> Self {
        Self {
            limiter,
            resolver,
            maintenance,
        }
    }
}

#[tonic::async_trait]
impl<S: QuotaStore + 'static> QuotaService for QuotaServiceImpl<S> {
    /// Evaluate and consume one unit of quota.
    ///
    /// Store failures never surface here; only an unknown limit type does.
    #[instrument(
        skip(self, request),
        fields(limit_type = %request.get_ref().limit_type)
    )]
    async fn check_and_consume(
        &self,
        request: Request<CheckAndConsumeRequest>,
    ) -> Result<Response<CheckAndConsumeResponse>, Status> {
        let req = request.into_inner();

        let limit_type = if req.limit_type.is_empty() {
            DEFAULT_LIMIT_TYPE
        } else {
            req.limit_type.as_str()
        };

        let policy = *self.limiter.policy(limit_type).map_err(|e| {
            warn!(limit_type = %limit_type, "Check requested for unknown limit type");
            Status::invalid_argument(e.to_string())
        })?;

        let identifier = match req.identifier.trim() {
            "" => {
                let caller = req.caller.map(Caller::from).unwrap_or_default();
                self.resolver.resolve(&caller)
            }
            explicit => explicit.to_string(),
        };

        let key = RateLimitKey::new(limit_type, &identifier);
        let decision = self.limiter.check_and_consume(&key, &policy).await;

        debug!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Rate limit decision made"
        );

        Ok(Response::new(CheckAndConsumeResponse {
            allowed: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: Some(to_timestamp(decision.reset_at)),
            retry_after_seconds: decision.retry_after_secs,
            identifier,
        }))
    }

    #[instrument(skip(self, request))]
    async fn reset_rate_limit(
        &self,
        request: Request<ResetRateLimitRequest>,
    ) -> Result<Response<ResetRateLimitResponse>, Status> {
        let req = request.into_inner();

        if req.identifier.is_empty() {
            return Err(Status::invalid_argument("identifier is required"));
        }
        if req.limit_type.is_empty() {
            return Err(Status::invalid_argument("limit_type is required"));
        }

        let removed = self
            .limiter
            .reset_rate_limit(&req.identifier, &req.limit_type)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        info!(
            identifier = %req.identifier,
            limit_type = %req.limit_type,
            removed,
            "Rate limit reset"
        );

        Ok(Response::new(ResetRateLimitResponse { removed }))
    }

    #[instrument(skip(self, _request))]
    async fn cleanup_expired(
        &self,
        _request: Request<CleanupExpiredRequest>,
    ) -> Result<Response<CleanupExpiredResponse>, Status> {
        let removed = self
            .maintenance
            .cleanup()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        Ok(Response::new(CleanupExpiredResponse {
            removed: removed as u64,
        }))
    }
}
