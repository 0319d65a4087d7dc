//! Tower layer enforcing a rate limit policy on a service.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::SecondsFormat;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::{ACCEPT_LANGUAGE, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::{debug, error};

use super::messages::{rate_limit_message, Locale};
use crate::error::{QuotaError, Result};
use crate::ratelimit::{
    Caller, CallerInfo, Decision, IdentityResolver, RateLimitKey, RateLimitPolicy, RateLimiter,
    DEFAULT_LIMIT_TYPE,
};
use crate::store::QuotaStore;

/// Header carrying the policy quota.
pub const RATE_LIMIT_HEADER: &str = "rate-limit";
/// Header carrying the calls left in the window.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "rate-limit-remaining";
/// Header carrying the reset time as RFC 3339.
pub const RATE_LIMIT_RESET_HEADER: &str = "rate-limit-reset";

/// Machine-readable code in throttling responses.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Log target for middleware failures, kept apart from store failures.
pub const ADAPTER_LOG_TARGET: &str = "quotagate::adapter";

/// Everything needed from the request to reach a decision.
struct CallSnapshot {
    caller: Caller,
    locale: Locale,
}

impl CallSnapshot {
    fn from_request<B>(request: &Request<B>) -> Self {
        let accept_language = request
            .headers()
            .get(ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok());

        Self {
            caller: Caller {
                principal_id: request.principal_id(),
                forwarded_for: request.forwarded_for(),
                remote_addr: request.remote_addr(),
            },
            locale: Locale::from_accept_language(accept_language),
        }
    }
}

struct Guard<S: QuotaStore> {
    limiter: Arc<RateLimiter<S>>,
    resolver: Arc<IdentityResolver>,
    limit_type: String,
    policy: RateLimitPolicy,
}

impl<S: QuotaStore> Guard<S> {
    async fn decide(&self, caller: &Caller) -> Decision {
        let identifier = self.resolver.resolve(caller);
        let key = RateLimitKey::new(&self.limit_type, &identifier);
        self.limiter.check_and_consume(&key, &self.policy).await
    }
}

/// Layer applying one rate limit policy to every request of a service.
pub struct RateLimitLayer<S: QuotaStore> {
    guard: Arc<Guard<S>>,
}

impl<S: QuotaStore> Clone for RateLimitLayer<S> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
        }
    }
}

impl<S: QuotaStore> RateLimitLayer<S> {
    /// Enforce the `general` policy.
    pub fn new(limiter: Arc<RateLimiter<S>>, resolver: Arc<IdentityResolver>) -> Result<Self> {
        Self::for_limit_type(limiter, resolver, DEFAULT_LIMIT_TYPE)
    }

    /// Enforce the policy registered for `limit_type`.
    ///
    /// Fails with `UnknownPolicy` if none is registered.
    pub fn for_limit_type(
        limiter: Arc<RateLimiter<S>>,
        resolver: Arc<IdentityResolver>,
        limit_type: &str,
    ) -> Result<Self> {
        let policy = *limiter.policy(limit_type)?;
        Ok(Self {
            guard: Arc::new(Guard {
                limiter,
                resolver,
                limit_type: limit_type.to_string(),
                policy,
            }),
        })
    }

    pub fn limit_type(&self) -> &str {
        &self.guard.limit_type
    }
}

impl<Inner, S: QuotaStore> Layer<Inner> for RateLimitLayer<S> {
    type Service = RateLimitService<Inner, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        RateLimitService {
            inner,
            guard: self.guard.clone(),
        }
    }
}

/// Service produced by `RateLimitLayer`.
pub struct RateLimitService<Inner, S: QuotaStore> {
    inner: Inner,
    guard: Arc<Guard<S>>,
}

impl<Inner: Clone, S: QuotaStore> Clone for RateLimitService<Inner, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<Inner, S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<Inner, S>
where
    Inner: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Error: Send + 'static,
    S: QuotaStore + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = Inner::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Use the instance that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let guard = self.guard.clone();
        let snapshot = CallSnapshot::from_request(&request);

        Box::pin(async move {
            let decision = AssertUnwindSafe(guard.decide(&snapshot.caller))
                .catch_unwind()
                .await;

            match decision {
                Ok(decision) if decision.allowed => {
                    let mut response = inner.call(request).await?;
                    apply_rate_limit_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                Ok(decision) => {
                    debug!(
                        limit_type = %guard.limit_type,
                        retry_after = ?decision.retry_after_secs,
                        "Throttling request"
                    );
                    Ok(too_many_requests(&decision, snapshot.locale))
                }
                Err(panic) => {
                    let err = QuotaError::AdapterInternal(panic_message(panic.as_ref()));
                    error!(
                        target: ADAPTER_LOG_TARGET,
                        limit_type = %guard.limit_type,
                        error = %err,
                        "Rate limit middleware failed, failing open"
                    );
                    inner.call(request).await
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic while computing rate limit decision".to_string())
}

fn format_reset(decision: &Decision) -> String {
    decision.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Set the informational quota headers.
fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(RATE_LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(decision.remaining));

    match HeaderValue::from_str(&format_reset(decision)) {
        Ok(value) => {
            headers.insert(RATE_LIMIT_RESET_HEADER, value);
        }
        Err(err) => {
            error!(
                target: ADAPTER_LOG_TARGET,
                error = %err,
                "Could not encode rate limit reset header"
            );
        }
    }
}

/// Build the throttling response.
fn too_many_requests<B: From<String>>(decision: &Decision, locale: Locale) -> Response<B> {
    let retry_after = decision.retry_after_secs.unwrap_or(1);
    let body = serde_json::json!({
        "code": RATE_LIMIT_EXCEEDED,
        "message": rate_limit_message(locale, retry_after),
        "retryAfter": retry_after,
        "resetAt": format_reset(decision),
    });

    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    apply_rate_limit_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::ratelimit::{AuthenticatedPrincipal, PolicyRegistry, RateLimitEntry, FORWARDED_FOR_HEADER};
    use crate::store::test_support::UnavailableStore;
    use crate::store::{EvaluateFn, MemoryStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::util::BoxCloneService;
    use tower::{service_fn, ServiceExt};

    /// Store whose transaction panics.
    struct PanickingStore;

    #[async_trait]
    impl QuotaStore for PanickingStore {
        async fn check_and_consume(
            &self,
            _key: &RateLimitKey,
            _evaluate: &EvaluateFn<'_>,
        ) -> std::result::Result<Decision, StoreError> {
            panic!("store driver bug");
        }

        async fn read(
            &self,
            _key: &RateLimitKey,
        ) -> std::result::Result<Option<RateLimitEntry>, StoreError> {
            Ok(None)
        }

        async fn delete(&self, _key: &RateLimitKey) -> std::result::Result<bool, StoreError> {
            Ok(false)
        }

        async fn delete_older_than(
            &self,
            _cutoff: DateTime<Utc>,
            _limit: usize,
        ) -> std::result::Result<usize, StoreError> {
            Ok(0)
        }
    }

    fn limiter_with<S: QuotaStore>(store: S, quota: u32) -> Arc<RateLimiter<S>> {
        let policies = PolicyRegistry::empty()
            .with_policy(DEFAULT_LIMIT_TYPE, RateLimitPolicy::new(quota, 60))
            .unwrap();
        Arc::new(RateLimiter::new(Arc::new(store), policies))
    }

    fn downstream(calls: Arc<AtomicUsize>) -> BoxCloneService<Request<()>, Response<String>, Infallible> {
        BoxCloneService::new(service_fn(move |_request: Request<()>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new("ok".to_string()))
            }
        }))
    }

    fn request_from(addr: &str) -> Request<()> {
        Request::builder()
            .header(FORWARDED_FOR_HEADER, addr)
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed_request_gets_headers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = RateLimitLayer::new(
            limiter_with(MemoryStore::new(), 2),
            Arc::new(IdentityResolver::default()),
        )
        .unwrap();
        let service = layer.layer(downstream(calls.clone()));

        let response = service.oneshot(request_from("203.0.113.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[RATE_LIMIT_HEADER], "2");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING_HEADER], "1");
        assert!(response.headers().contains_key(RATE_LIMIT_RESET_HEADER));
        assert!(!response.headers().contains_key(RETRY_AFTER));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_caller_is_throttled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = RateLimitLayer::new(
            limiter_with(MemoryStore::new(), 2),
            Arc::new(IdentityResolver::default()),
        )
        .unwrap();
        let service = layer.layer(downstream(calls.clone()));

        for _ in 0..2 {
            let response = service
                .clone()
                .oneshot(request_from("203.0.113.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = service
            .clone()
            .oneshot(request_from("203.0.113.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING_HEADER], "0");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let retry_after: u64 = response.headers()[RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1 && retry_after <= 60);

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["code"], RATE_LIMIT_EXCEEDED);
        assert_eq!(body["retryAfter"], retry_after);
        assert!(body["resetAt"].as_str().unwrap().ends_with('Z'));
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains(&retry_after.to_string()));

        // Downstream was not invoked for the throttled call
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // A different caller is unaffected
        let response = service.oneshot(request_from("203.0.113.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_throttle_message_is_localized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = RateLimitLayer::new(
            limiter_with(MemoryStore::new(), 1),
            Arc::new(IdentityResolver::default()),
        )
        .unwrap();
        let service = layer.layer(downstream(calls));

        let principal_request = |lang: &str| {
            let mut request = Request::builder()
                .header(ACCEPT_LANGUAGE, lang)
                .body(())
                .unwrap();
            request
                .extensions_mut()
                .insert(AuthenticatedPrincipal("maria".to_string()));
            request
        };

        service.clone().oneshot(principal_request("es")).await.unwrap();
        let response = service.oneshot(principal_request("es-MX")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert!(body["message"].as_str().unwrap().starts_with("Demasiadas"));
    }

    #[tokio::test]
    async fn test_store_failure_passes_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = RateLimitLayer::new(
            limiter_with(UnavailableStore, 3),
            Arc::new(IdentityResolver::default()),
        )
        .unwrap();
        let service = layer.layer(downstream(calls.clone()));

        let response = service.oneshot(request_from("198.51.100.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING_HEADER], "3");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_internal_panic_fails_open() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = RateLimitLayer::new(
            limiter_with(PanickingStore, 3),
            Arc::new(IdentityResolver::default()),
        )
        .unwrap();
        let service = layer.layer(downstream(calls.clone()));

        let response = service.oneshot(request_from("198.51.100.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(RATE_LIMIT_HEADER));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_limit_type_rejected() {
        let result = RateLimitLayer::for_limit_type(
            limiter_with(MemoryStore::new(), 3),
            Arc::new(IdentityResolver::default()),
            "no_such_policy",
        );
        assert!(matches!(result, Err(QuotaError::UnknownPolicy(_))));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert!(panic_message(boxed.as_ref()).contains("panic"));
    }
}
