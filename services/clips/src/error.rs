use crate::store_manager::StoreError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Every failure a request can end in.
///
/// The observability middleware reads the [`ErrorContext`] each variant leaves
/// on its response, so mapping to status codes never inspects message text.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::StoreUnavailable(_) => "store_unavailable",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show clients; internal detail stays in the logs
    pub fn client_message(&self) -> String {
        match self {
            ServiceError::RateLimited { .. } => {
                "Rate limit exceeded. Please try again later.".to_string()
            }
            ServiceError::StoreUnavailable(_) => {
                "The clip store is temporarily unavailable. Please retry later.".to_string()
            }
            ServiceError::NotFound(message) | ServiceError::BadRequest(message) => message.clone(),
            ServiceError::Internal(_) => "An unexpected error occurred".to_string(),
        }
    }
}

/// Uniform JSON body for every error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub message: String,
    /// Unix time in seconds
    pub timestamp: f64,
}

impl ErrorEnvelope {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Server-side detail attached to error responses for logging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub kind: &'static str,
    pub detail: String,
}

/// Build an envelope response with its logging context
pub fn error_response(
    status: StatusCode,
    kind: &'static str,
    message: impl Into<String>,
    detail: impl Into<String>,
) -> Response {
    let mut response = (status, Json(ErrorEnvelope::new(kind, message))).into_response();
    response.extensions_mut().insert(ErrorContext {
        kind,
        detail: detail.into(),
    });
    response
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let mut response = error_response(
            self.status_code(),
            self.kind(),
            self.client_message(),
            format!("{self:#}"),
        );

        if let ServiceError::RateLimited { retry_after } = &self {
            // Round up so clients never retry early.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ServiceError::RateLimited {
                    retry_after: Duration::from_secs(3),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ServiceError::StoreUnavailable(StoreError::Exhausted {
                    attempts: 3,
                    last_error: "timeout".to_string(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ServiceError::NotFound("Clip with id 7 not found".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                ServiceError::BadRequest("bad".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ServiceError::Internal(anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.status_code(), status);
        }
    }

    #[test]
    fn test_internal_detail_not_exposed() {
        let error = ServiceError::Internal(anyhow!("password authentication failed for user"));
        assert_eq!(error.client_message(), "An unexpected error occurred");

        let response = error.into_response();
        let context = response.extensions().get::<ErrorContext>().unwrap();
        assert_eq!(context.kind, "internal_error");
        assert!(context.detail.contains("password authentication"));
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ServiceError::RateLimited {
            retry_after: Duration::from_millis(2500),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
    }
}
