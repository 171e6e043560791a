//! Integration tests for the proxy pipeline
//!
//! These tests drive the full router with a mock upstream fetcher and verify
//! end-to-end behavior:
//! - HTML rewriting, script injection, and header sanitization per response
//! - Validation rejections short-circuiting before any outbound fetch
//! - Probe mode reporting existence without a body
//! - Rate admission rejections and their response headers
//! - Error body shape for upstream failures

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use tower::ServiceExt;
use url::Url;

use siteproxy::config::{AppConfig, WindowLimit};
use siteproxy::error::ProxyError;
use siteproxy::fetcher::{Fetch, FetchMode, UpstreamResponse};
use siteproxy::server::{router, AppState};

/// Scripted upstream that records every call
struct MockFetcher {
    calls: AtomicUsize,
    status: u16,
    content_type: &'static str,
    body: &'static str,
    headers: Vec<(&'static str, &'static str)>,
    fail_with_status: Option<u16>,
}

impl MockFetcher {
    fn html(body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            status: 200,
            content_type: "text/html; charset=utf-8",
            body,
            headers: Vec::new(),
            fail_with_status: None,
        })
    }

    fn with_headers(mut self: Arc<Self>, headers: Vec<(&'static str, &'static str)>) -> Arc<Self> {
        Arc::get_mut(&mut self).unwrap().headers = headers;
        self
    }

    fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            status: 200,
            content_type: "text/html",
            body: "",
            headers: Vec::new(),
            fail_with_status: Some(status),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for MockFetcher {
    async fn fetch(
        &self,
        _target: &Url,
        _mode: FetchMode,
        _client_headers: &HeaderMap,
    ) -> Result<UpstreamResponse, ProxyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.fail_with_status {
            return Err(ProxyError::UpstreamServerError(status));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static(self.content_type),
        );
        for (name, value) in &self.headers {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_static(value),
            );
        }

        Ok(UpstreamResponse {
            status: self.status,
            headers,
            body: Bytes::from_static(self.body.as_bytes()),
            content_type: Some(self.content_type.to_string()),
        })
    }
}

fn app(config: AppConfig, fetcher: Arc<MockFetcher>) -> Router {
    let state = AppState::new(Arc::new(config), fetcher);
    router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

#[tokio::test]
async fn html_page_rewritten_end_to_end() {
    let fetcher = MockFetcher::html(
        r#"<html><head><title>t</title></head><body><a href="/about">About</a><img src="logo.png"></body></html>"#,
    )
    .with_headers(vec![("x-frame-options", "DENY"), ("etag", "\"v1\"")]);

    let app = app(AppConfig::default(), fetcher.clone());
    let (status, headers, body) =
        get(&app, "/proxy?url=https%3A%2F%2Fexample.com%2Fpage").await;
    let html = String::from_utf8(body.to_vec()).unwrap();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetcher.call_count(), 1);

    // References absolutized against the target
    assert!(html.contains("https://example.com/about"));
    assert!(html.contains("https://example.com/logo.png"));
    // Base element and overlay script injected
    assert!(html.contains("<base href="));
    assert!(html.contains("data-proxy-injected"));

    // Deny-listed upstream header stripped, preserved one forwarded
    assert!(headers.get("x-frame-options").is_none());
    assert_eq!(headers.get("etag").unwrap(), "\"v1\"");
    // Always-added response policy headers
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(headers.get("x-robots-tag").unwrap(), "noindex, nofollow");
    // Admission headers on every response
    assert!(headers.get("x-ratelimit-limit").is_some());
    assert!(headers.get("x-ratelimit-remaining").is_some());
    assert!(headers.get("x-ratelimit-reset").is_some());
    // Stale upstream framing dropped after rewriting
    assert!(headers.get("content-length").is_none() || !html.is_empty());
}

#[tokio::test]
async fn rejected_target_never_reaches_fetcher() {
    let fetcher = MockFetcher::html("unused");
    let app = app(AppConfig::default(), fetcher.clone());

    let (status, _, body) = get(&app, "/proxy?url=javascript%3Aalert(1)").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(fetcher.call_count(), 0);

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["statusCode"], 400);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn missing_url_param_rejected() {
    let fetcher = MockFetcher::html("unused");
    let app = app(AppConfig::default(), fetcher.clone());

    let (status, _, _) = get(&app, "/proxy").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test]
async fn internal_host_rejected() {
    let fetcher = MockFetcher::html("unused");
    let app = app(AppConfig::default(), fetcher.clone());

    for target in [
        "http%3A%2F%2Flocalhost%2Fadmin",
        "http%3A%2F%2F127.0.0.1%2F",
        "http%3A%2F%2F192.168.1.1%2F",
        "http%3A%2F%2F169.254.169.254%2Flatest%2Fmeta-data",
    ] {
        let (status, _, _) = get(&app, &format!("/proxy?url={}", target)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "target {}", target);
    }
    assert_eq!(fetcher.call_count(), 0);
}

#[tokio::test]
async fn probe_mode_reports_existence_only() {
    let fetcher = MockFetcher::html("<html><body>full page</body></html>");
    let app = app(AppConfig::default(), fetcher.clone());

    let (status, headers, body) =
        get(&app, "/proxy?url=https%3A%2F%2Fexample.com&test=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetcher.call_count(), 1);

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], true);
    assert!(headers.get("x-ratelimit-limit").is_some());
}

#[tokio::test]
async fn rate_limit_rejection_carries_retry_hint() {
    let mut config = AppConfig::default();
    config.rate_limit.classes.insert(
        "proxy".to_string(),
        WindowLimit {
            max_requests: 2,
            window_secs: 60,
        },
    );

    let fetcher = MockFetcher::html("<html><body>ok</body></html>");
    let app = app(config, fetcher.clone());
    let uri = "/proxy?url=https%3A%2F%2Fexample.com";

    assert_eq!(get(&app, uri).await.0, StatusCode::OK);
    assert_eq!(get(&app, uri).await.0, StatusCode::OK);

    let (status, headers, body) = get(&app, uri).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    // The rejected request never reached the fetcher
    assert_eq!(fetcher.call_count(), 2);

    assert!(headers.get("retry-after").is_some());
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["statusCode"], 429);
    assert!(json["retryAfter"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn upstream_server_error_maps_to_bad_gateway() {
    let fetcher = MockFetcher::failing(503);
    let app = app(AppConfig::default(), fetcher.clone());

    let (status, _, body) = get(&app, "/proxy?url=https%3A%2F%2Fexample.com").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["statusCode"], 502);
}

#[tokio::test]
async fn production_config_hides_error_details() {
    let mut config = AppConfig::default();
    config.server.production = true;

    let fetcher = MockFetcher::failing(500);
    let app = app(config, fetcher);

    let (_, _, body) = get(&app, "/proxy?url=https%3A%2F%2Fexample.com").await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json.get("details").is_none());
}

#[tokio::test]
async fn malformed_query_rendered_as_json_error() {
    let fetcher = MockFetcher::html("unused");
    let app = app(AppConfig::default(), fetcher.clone());

    let (status, headers, body) =
        get(&app, "/proxy?url=https%3A%2F%2Fexample.com&test=notabool").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(fetcher.call_count(), 0);

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["statusCode"], 400);
    assert!(json["error"].is_string());
    assert!(headers.get("x-ratelimit-limit").is_some());
}

#[tokio::test]
async fn still_compressed_html_body_passes_through() {
    // An encoding the client could not decode survives as content-encoding;
    // the opaque bytes must not be rewritten.
    let fetcher = MockFetcher::html("(\u{b5}/ opaque compressed bytes")
        .with_headers(vec![("content-encoding", "zstd")]);
    let app = app(AppConfig::default(), fetcher);

    let (status, headers, body) = get(&app, "/proxy?url=https%3A%2F%2Fexample.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], "(\u{b5}/ opaque compressed bytes".as_bytes());
    assert!(!body.windows(4).any(|w| w == b"base"));
    assert_eq!(headers.get("content-encoding").unwrap(), "zstd");
}

#[tokio::test]
async fn non_html_body_passes_through_unmodified() {
    let fetcher = Arc::new(MockFetcher {
        calls: AtomicUsize::new(0),
        status: 200,
        content_type: "application/json",
        body: r#"{"data":[1,2,3]}"#,
        headers: Vec::new(),
        fail_with_status: None,
    });
    let app = app(AppConfig::default(), fetcher);

    let (status, _, body) =
        get(&app, "/proxy?url=https%3A%2F%2Fexample.com%2Fapi.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], br#"{"data":[1,2,3]}"#);
}
