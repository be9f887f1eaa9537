//! Sliding-window rate limiting for inbound requests.
//!
//! Identifier priority: user id, then API key, then client IP. Health and
//! docs paths are exempt; auth endpoints deliberately are not. If the
//! limiter's backing state is unavailable the middleware fails open.
//! Responses carry the standard limit/remaining/reset fields, plus
//! Retry-After on rejection.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::errors::StoreError;

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
    pub retry_after: Option<Duration>,
}

pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    hits: DashMap<String, Mutex<Vec<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            hits: DashMap::new(),
        }
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.config
            .exempt_paths
            .iter()
            .any(|exempt| path == exempt || path.starts_with(&format!("{exempt}/")))
    }

    /// Record-and-check under the identifier's lock, so concurrent
    /// requests can never admit more than the limit per window.
    pub fn check(&self, identifier: &str) -> Result<RateDecision, StoreError> {
        let window = Duration::from_secs(self.config.window_seconds);
        let limit = self.config.requests_per_window;
        let now = Instant::now();

        let entry = self
            .hits
            .entry(identifier.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()));
        let mut hits = entry
            .lock()
            .map_err(|_| StoreError::Conflict("rate limiter state poisoned".to_string()))?;
        hits.retain(|t| now.duration_since(*t) < window);

        let oldest = hits.first().copied();
        if (hits.len() as u32) < limit {
            hits.push(now);
            Ok(RateDecision {
                allowed: true,
                limit,
                remaining: limit - hits.len() as u32,
                reset_after: oldest
                    .map(|t| window.saturating_sub(now.duration_since(t)))
                    .unwrap_or(window),
                retry_after: None,
            })
        } else {
            let retry_after = oldest
                .map(|t| window.saturating_sub(now.duration_since(t)))
                .unwrap_or(window);
            Ok(RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_after: retry_after,
                retry_after: Some(retry_after),
            })
        }
    }
}

/// Resolve the limiting identifier from request headers.
pub fn identify(request: &Request<Body>) -> String {
    let headers = request.headers();
    if let Some(user) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        return format!("user:{user}");
    }
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return format!("key:{key}");
    }
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim();
    format!("ip:{ip}")
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<SlidingWindowLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.config.enabled || limiter.is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let identifier = identify(&request);
    let decision = match limiter.check(&identifier) {
        Ok(decision) => decision,
        Err(err) => {
            // Fail open: a broken limiter must not take the API down.
            tracing::warn!(error = %err, "rate limiter unavailable, failing open");
            return next.run(request).await;
        }
    };

    if decision.allowed {
        let mut response = next.run(request).await;
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(serde_json::json!({
            "kind": "rate_limited",
            "message": "request rate limit exceeded",
        })),
    )
        .into_response();
    apply_headers(response.headers_mut(), &decision);
    if let Some(retry_after) = decision.retry_after
        && let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string())
    {
        response.headers_mut().insert("retry-after", value);
    }
    response
}

fn apply_headers(headers: &mut axum::http::HeaderMap, decision: &RateDecision) {
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_after.as_secs().to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}
