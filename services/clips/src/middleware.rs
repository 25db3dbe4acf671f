//! Request middleware.
//!
//! The chain is composed once in [`crate::api::create_router`]:
//!
//! ```text
//! Request → observe_requests → enforce_rate_limit → handler (acquires store handle)
//!              ↓                      ↓                        ↓
//!          metrics, log,         429 envelope           503 / 404 / 400 / 500
//!          X-Process-Time
//! ```
//!
//! `observe_requests` is the outermost layer so every exit path, including a
//! panicking handler, is recorded exactly once.

use crate::config::RateLimitConfig;
use crate::error::{error_response, ErrorContext, ServiceError};
use crate::observability::RequestMetrics;
use crate::rate_limiter::{RateDecision, RateLimitRule, RateLimiter, UNKNOWN_CLIENT};
use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Processing time header, in seconds
pub const PROCESS_TIME_HEADER: &str = "x-process-time";

/// Route label for requests that matched no route
pub const UNMATCHED_ROUTE: &str = "<unmatched>";

/// State for [`observe_requests`]
#[derive(Clone)]
pub struct RequestObserver {
    metrics: Arc<RequestMetrics>,
    static_headers: Arc<HeaderMap>,
}

impl RequestObserver {
    /// Invalid header names or values are skipped with a warning.
    pub fn new(
        metrics: Arc<RequestMetrics>,
        deployment_headers: &HashMap<String, String>,
    ) -> Self {
        let mut static_headers = HeaderMap::new();
        for (name, value) in deployment_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    static_headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid deployment header"),
            }
        }

        Self {
            metrics,
            static_headers: Arc::new(static_headers),
        }
    }

    pub fn metrics(&self) -> &Arc<RequestMetrics> {
        &self.metrics
    }
}

/// Time, record, annotate and log every request.
pub async fn observe_requests(
    State(observer): State<RequestObserver>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    let outcome = AssertUnwindSafe(next.run(request)).catch_unwind().await;
    let elapsed = started.elapsed();

    let mut response = match outcome {
        Ok(response) => response,
        Err(panic) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "An unexpected error occurred",
            format!("handler panicked: {}", panic_message(panic.as_ref())),
        ),
    };

    let failed = response.status().is_client_error() || response.status().is_server_error();
    if failed && response.extensions().get::<ErrorContext>().is_none() {
        response = envelope_bare_error(response);
    }

    let status = response.status();
    observer
        .metrics
        .record_request(method.as_str(), &route, status, elapsed);

    let seconds = elapsed.as_secs_f64();
    if let Ok(value) = HeaderValue::from_str(&format!("{seconds:.6}")) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(PROCESS_TIME_HEADER), value);
    }
    for (name, value) in observer.static_headers.iter() {
        response.headers_mut().insert(name.clone(), value.clone());
    }

    let duration_ms = seconds * 1000.0;
    let context = response.extensions().get::<ErrorContext>();
    let error_kind = context.map(|c| c.kind).unwrap_or("");
    let detail = context.map(|c| c.detail.as_str()).unwrap_or("");

    if status.is_server_error() {
        error!(
            method = %method,
            path = %path,
            route = %route,
            status = status.as_u16(),
            duration_ms = duration_ms,
            error_kind = error_kind,
            error = detail,
            "Request failed"
        );
    } else if status.is_client_error() {
        warn!(
            method = %method,
            path = %path,
            route = %route,
            status = status.as_u16(),
            duration_ms = duration_ms,
            error_kind = error_kind,
            error = detail,
            "Request rejected"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            route = %route,
            status = status.as_u16(),
            duration_ms = duration_ms,
            "Request completed"
        );
    }

    response
}

/// Rebuild an error response produced outside our handlers (axum's 405,
/// body limits) as an envelope, keeping its headers such as `Allow`.
fn envelope_bare_error(response: Response) -> Response {
    let (parts, _body) = response.into_parts();
    let status = parts.status;

    let mut enveloped = error_response(
        status,
        kind_for_status(status),
        status.canonical_reason().unwrap_or("Request failed"),
        format!("{status} produced without an error envelope"),
    );
    for (name, value) in parts.headers.iter() {
        if name != header::CONTENT_TYPE && name != header::CONTENT_LENGTH {
            enveloped.headers_mut().insert(name.clone(), value.clone());
        }
    }
    enveloped
}

fn kind_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "bad_request",
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::METHOD_NOT_ALLOWED => "method_not_allowed",
        StatusCode::PAYLOAD_TOO_LARGE => "payload_too_large",
        StatusCode::UNSUPPORTED_MEDIA_TYPE => "unsupported_media_type",
        StatusCode::TOO_MANY_REQUESTS => "rate_limited",
        s if s.is_client_error() => "client_error",
        _ => "internal_error",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// State for [`enforce_rate_limit`]
#[derive(Clone)]
pub struct RateLimitGate {
    limiter: Arc<RateLimiter>,
    read: RateLimitRule,
    write: RateLimitRule,
    trust_forwarded_for: bool,
}

impl RateLimitGate {
    pub fn new(
        limiter: Arc<RateLimiter>,
        read: RateLimitRule,
        write: RateLimitRule,
        trust_forwarded_for: bool,
    ) -> Self {
        Self {
            limiter,
            read,
            write,
            trust_forwarded_for,
        }
    }

    pub fn from_config(limiter: Arc<RateLimiter>, config: &RateLimitConfig) -> Self {
        Self::new(
            limiter,
            RateLimitRule::from_config("read", &config.read),
            RateLimitRule::from_config("write", &config.write),
            config.trust_forwarded_for,
        )
    }

    /// Safe methods share the read budget; everything else the write budget
    pub fn rule_for(&self, method: &Method) -> &RateLimitRule {
        if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
            &self.read
        } else {
            &self.write
        }
    }
}

/// Admit or reject the request against its client's window.
pub async fn enforce_rate_limit(
    State(gate): State<RateLimitGate>,
    request: Request,
    next: Next,
) -> Response {
    let identity = client_identity(&request, gate.trust_forwarded_for);
    let rule = gate.rule_for(request.method());

    match gate
        .limiter
        .check_and_record(&identity, rule, Instant::now())
    {
        RateDecision::Admitted => next.run(request).await,
        RateDecision::Rejected { retry_after } => {
            warn!(
                client = %identity,
                scope = rule.scope,
                path = %request.uri().path(),
                "Rate limit exceeded"
            );
            ServiceError::RateLimited { retry_after }.into_response()
        }
    }
}

/// Identity a request is rate limited under.
///
/// The first `X-Forwarded-For` hop when trusted, otherwise the peer address,
/// otherwise the shared `"unknown"` identity.
pub fn client_identity(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = forwarded {
            return hop.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}
