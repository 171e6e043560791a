//! Error taxonomy for the proxy core
//!
//! Every failure a client can observe maps to exactly one variant here, and
//! every variant maps to one externally visible status code. Internal detail
//! strings are only surfaced in non-production configuration.

use axum::http::StatusCode;
use serde::Serialize;

use crate::validator::ReasonCode;

/// Failures surfaced by the proxy pipeline
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Target rejected by validation - user-correctable
    #[error("invalid target: {message}")]
    Validation {
        reason: ReasonCode,
        message: String,
    },

    /// Request rejected by the admission controller
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Upstream did not respond within the fetch deadline
    #[error("upstream request timed out")]
    UpstreamTimeout,

    /// Upstream could not be reached (DNS, connect, redirect loop)
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Upstream returned 404 for the target resource
    #[error("upstream resource not found")]
    UpstreamNotFound,

    /// Upstream returned a 5xx status
    #[error("upstream server error: {0}")]
    UpstreamServerError(u16),

    /// Upstream response exceeded the configured size ceiling
    #[error("upstream response exceeded {0} bytes")]
    ResponseTooLarge(u64),

    /// Internal failure that could not degrade gracefully
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Externally visible status code for this failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamNotFound => StatusCode::NOT_FOUND,
            Self::UpstreamServerError(_) => StatusCode::BAD_GATEWAY,
            Self::ResponseTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// User-safe message carried in the error body regardless of environment
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation { message, .. } => message.clone(),
            Self::RateLimited { .. } => "Too many requests".to_string(),
            Self::UpstreamTimeout => "The target site took too long to respond".to_string(),
            Self::UpstreamUnreachable(_) => "The target site could not be reached".to_string(),
            Self::UpstreamNotFound => "The requested resource was not found".to_string(),
            Self::UpstreamServerError(_) => "The target site returned an error".to_string(),
            Self::ResponseTooLarge(_) => "The target resource is too large to proxy".to_string(),
            Self::Internal(_) => "Internal proxy error".to_string(),
        }
    }

    /// Retry hint, present only for admission rejections
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Diagnostic detail, only exposed outside production
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Validation { reason, .. } => Some(format!("reason code: {:?}", reason)),
            Self::UpstreamUnreachable(detail) | Self::Internal(detail) => Some(detail.clone()),
            Self::UpstreamServerError(status) => Some(format!("upstream status: {}", status)),
            Self::ResponseTooLarge(limit) => Some(format!("size ceiling: {} bytes", limit)),
            _ => None,
        }
    }
}

/// JSON error body returned for all non-2xx responses
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    /// Build the wire body for an error, honoring the production flag
    pub fn from_error(err: &ProxyError, production: bool) -> Self {
        Self {
            error: err.public_message(),
            status_code: err.status_code().as_u16(),
            retry_after: err.retry_after(),
            details: if production { None } else { err.detail() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            ProxyError::UpstreamTimeout.status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ProxyError::UpstreamServerError(503).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::ResponseTooLarge(1024).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyError::UpstreamNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn production_hides_details() {
        let err = ProxyError::Internal("stack trace here".to_string());
        let body = ErrorBody::from_error(&err, true);
        assert!(body.details.is_none());

        let body = ErrorBody::from_error(&err, false);
        assert_eq!(body.details.as_deref(), Some("stack trace here"));
    }

    #[test]
    fn retry_after_only_on_rate_limit() {
        let err = ProxyError::RateLimited { retry_after_secs: 30 };
        let body = ErrorBody::from_error(&err, true);
        assert_eq!(body.retry_after, Some(30));

        let err = ProxyError::UpstreamTimeout;
        let body = ErrorBody::from_error(&err, true);
        assert!(body.retry_after.is_none());
    }

    #[test]
    fn error_body_field_names() {
        let err = ProxyError::RateLimited { retry_after_secs: 5 };
        let json = serde_json::to_value(ErrorBody::from_error(&err, true)).unwrap();
        assert!(json.get("statusCode").is_some());
        assert!(json.get("retryAfter").is_some());
        assert!(json.get("error").is_some());
    }
}
