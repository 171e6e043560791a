//! Proxy orchestrator and HTTP surface
//!
//! Composes admission, validation, fetch, rewrite, and header sanitization
//! into the request/response cycle:
//!
//! RECEIVED -> ADMITTED | REJECTED_RATE
//!          -> VALIDATED | REJECTED_TARGET
//!          -> FETCHED | FETCH_FAILED
//!          -> REWRITTEN | PASSTHROUGH
//!          -> RESPONDED
//!
//! Each request makes exactly one attempt end-to-end; nothing is retried.
//! Rewrite failures degrade to the original body instead of erroring the
//! response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::QueryRejection, ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::{ErrorBody, ProxyError};
use crate::fetcher::{Fetch, FetchMode, UpstreamResponse};
use crate::headers::sanitize;
use crate::rate_limit::{Admission, AdmissionRegistry, EndpointClass};
use crate::rewriter::{rewrite, RewriteContext, RewriteOutcome};
use crate::validator::{ReasonCode, TargetValidator};

/// Shared state for all request handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub validator: Arc<TargetValidator>,
    pub admission: Arc<AdmissionRegistry>,
    pub fetcher: Arc<dyn Fetch>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            validator: Arc::new(TargetValidator::new(&config.validation)),
            admission: Arc::new(AdmissionRegistry::new(&config.rate_limit)),
            config,
            fetcher,
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/proxy", get(proxy_handler))
        .with_state(state)
}

/// Query parameters of the proxy endpoint
#[derive(Debug, Deserialize)]
pub struct ProxyParams {
    url: Option<String>,
    #[serde(default)]
    test: Option<bool>,
}

/// The proxy request pipeline
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    params: Result<Query<ProxyParams>, QueryRejection>,
    client_headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let client_key = client_addr.ip().to_string();

    // Admission first: a rejected request never reaches validation
    let admission = state
        .admission
        .get(EndpointClass::Proxy)
        .check(&client_key);
    if !admission.admitted {
        debug!("Rate limit exceeded for {}", client_key);
        let err = ProxyError::RateLimited {
            retry_after_secs: admission.retry_after_secs.unwrap_or(1),
        };
        return error_response(&err, &state, &admission);
    }

    // A query string the extractor cannot parse still gets the standard
    // error body, not axum's plain-text rejection
    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => {
            debug!("Malformed query from {}: {}", client_key, rejection);
            let err = ProxyError::Validation {
                reason: ReasonCode::BadFormat,
                message: "Malformed query string".to_string(),
            };
            return error_response(&err, &state, &admission);
        }
    };

    // Validation second: a rejected target never reaches the fetcher
    let raw_url = params.url.unwrap_or_default();
    let verdict = state.validator.validate(&raw_url);
    if !verdict.allowed {
        warn!(
            "Rejected target from {} ({:?}): {}",
            client_key,
            verdict.reason,
            truncate(&raw_url, 120)
        );
        let err = ProxyError::Validation {
            reason: verdict.reason,
            message: verdict.message,
        };
        return error_response(&err, &state, &admission);
    }

    // Validation guarantees parseability
    let target = match Url::parse(&raw_url) {
        Ok(target) => target,
        Err(_) => {
            let err = ProxyError::Internal("validated URL failed to parse".to_string());
            return error_response(&err, &state, &admission);
        }
    };

    let mode = if params.test.unwrap_or(false) {
        FetchMode::Probe
    } else {
        FetchMode::Full
    };

    let upstream = match state.fetcher.fetch(&target, mode, &client_headers).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!("Fetch of {} failed: {}", target, err);
            return error_response(&err, &state, &admission);
        }
    };

    let response = match mode {
        FetchMode::Probe => probe_response(&admission),
        FetchMode::Full => full_response(upstream, &target, &state, &admission),
    };

    info!(
        "Proxied {} for {} in {}ms (status {})",
        target,
        client_key,
        started.elapsed().as_millis(),
        response.status()
    );
    response
}

/// Probe mode reports existence only
fn probe_response(admission: &Admission) -> Response {
    let mut response = Json(json!({ "success": true })).into_response();
    apply_admission_headers(response.headers_mut(), admission);
    response
}

/// Full mode: rewrite when the content type calls for it, sanitize headers,
/// relay the upstream status.
fn full_response(
    upstream: UpstreamResponse,
    target: &Url,
    state: &AppState,
    admission: &Admission,
) -> Response {
    let ctx = RewriteContext::new(
        target.clone(),
        state.config.server.public_url.clone(),
        state.config.rewrite.script_url.clone(),
    );

    // A content-encoding that survived the client means the body is still
    // compressed; rewriting would mangle it.
    let outcome = if identity_encoded(&upstream.headers) {
        rewrite(&upstream.body, upstream.content_type.as_deref(), &ctx)
    } else {
        debug!("Undecoded body from {}, passing through", target);
        RewriteOutcome::Passthrough
    };
    let (body, rewritten) = match outcome {
        RewriteOutcome::Rewritten(body) => (body, true),
        RewriteOutcome::Passthrough => (upstream.body.clone(), false),
    };
    debug!(
        "Response for {}: {} bytes, rewritten={}",
        target,
        body.len(),
        rewritten
    );

    let mut out_headers = sanitize(&upstream.headers, &ctx);
    if rewritten {
        // The transformed body no longer matches the upstream length or
        // encoding; the server recomputes both.
        out_headers.remove(header::CONTENT_LENGTH);
        out_headers.remove(header::CONTENT_ENCODING);
    }
    apply_admission_headers(&mut out_headers, admission);

    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
    (status, out_headers, body).into_response()
}

/// Map a pipeline failure onto the wire error shape
fn error_response(err: &ProxyError, state: &AppState, admission: &Admission) -> Response {
    let body = ErrorBody::from_error(err, state.config.server.production);
    let mut response = (err.status_code(), Json(body)).into_response();

    apply_admission_headers(response.headers_mut(), admission);
    if let Some(retry_after) = err.retry_after() {
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_str(&retry_after.to_string())
                .unwrap_or(HeaderValue::from_static("1")),
        );
    }

    response
}

/// Standard admission-result headers on every response from a controlled
/// endpoint
fn apply_admission_headers(headers: &mut HeaderMap, admission: &Admission) {
    headers.insert(
        "x-ratelimit-limit",
        HeaderValue::from_str(&admission.limit.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-ratelimit-remaining",
        HeaderValue::from_str(&admission.remaining.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from_str(&admission.reset_at.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
}

/// True when the upstream body arrived decoded (no content-encoding, or an
/// explicit identity)
fn identity_encoded(headers: &HeaderMap) -> bool {
    match headers.get(header::CONTENT_ENCODING) {
        None => true,
        Some(value) => value
            .to_str()
            .map(|v| v.trim().eq_ignore_ascii_case("identity"))
            .unwrap_or(false),
    }
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::Admission;

    #[test]
    fn admission_headers_applied() {
        let admission = Admission {
            admitted: true,
            limit: 60,
            remaining: 42,
            reset_at: 1_700_000_000,
            retry_after_secs: None,
        };
        let mut headers = HeaderMap::new();
        apply_admission_headers(&mut headers, &admission);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "60");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "42");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "1700000000");
    }

    #[test]
    fn identity_encoding_detection() {
        let mut headers = HeaderMap::new();
        assert!(identity_encoded(&headers));

        headers.insert(
            header::CONTENT_ENCODING,
            HeaderValue::from_static("identity"),
        );
        assert!(identity_encoded(&headers));

        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        assert!(!identity_encoded(&headers));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("short", 120), "short");
    }
}
