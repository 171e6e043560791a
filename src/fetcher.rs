//! Outbound fetch of upstream resources
//!
//! Two fetch modes:
//! - **Probe**: lightweight existence check (HEAD, short timeout, no body)
//! - **Full**: real fetch with bounded timeout, capped redirect following,
//!   curated forwarded-header subset, and a streaming size ceiling
//!
//! The `Fetch` trait is the seam between the orchestrator and the network so
//! tests can substitute a mock and assert on call counts.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::ProxyError;

/// Fetch mode selected by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Existence check: no body download, short timeout
    Probe,
    /// Real fetch with body
    Full,
}

/// Response received from the upstream server
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Multi-valued upstream headers, pre-sanitization
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// Seam between the orchestrator and the network
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        target: &Url,
        mode: FetchMode,
        client_headers: &HeaderMap,
    ) -> Result<UpstreamResponse, ProxyError>;
}

/// Client request headers forwarded to the upstream. Host, connection,
/// cookie, and authorization headers are never forwarded.
const FORWARDED_HEADERS: &[header::HeaderName] = &[
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
    header::CACHE_CONTROL,
    header::PRAGMA,
    header::REFERER,
];

/// Encodings the client decodes transparently. The client's own
/// accept-encoding is never forwarded: it may advertise encodings (zstd)
/// that would arrive as opaque bytes and break rewriting.
const ACCEPTED_ENCODINGS: &str = "gzip, deflate, br";

/// Build the curated upstream request headers from the client's
fn forwarded_headers(client_headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        for value in client_headers.get_all(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded.insert(
        header::ACCEPT_ENCODING,
        header::HeaderValue::from_static(ACCEPTED_ENCODINGS),
    );
    forwarded
}

/// reqwest-backed upstream fetcher
pub struct UpstreamFetcher {
    client: reqwest::Client,
    probe_timeout: Duration,
    full_timeout: Duration,
    max_response_bytes: u64,
}

impl UpstreamFetcher {
    /// Build the fetcher and its HTTP client from config
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            full_timeout: Duration::from_secs(config.full_timeout_secs),
            max_response_bytes: config.max_response_bytes,
        })
    }

    async fn probe(&self, target: &Url) -> Result<UpstreamResponse, ProxyError> {
        let response = self
            .client
            .head(target.clone())
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        debug!("Probe of {} returned {}", target, status);
        if status >= 500 {
            return Err(ProxyError::UpstreamServerError(status));
        }

        Ok(UpstreamResponse {
            status,
            content_type: content_type_of(response.headers()),
            headers: response.headers().clone(),
            body: Bytes::new(),
        })
    }

    async fn full(
        &self,
        target: &Url,
        client_headers: &HeaderMap,
    ) -> Result<UpstreamResponse, ProxyError> {
        let response = self
            .client
            .get(target.clone())
            .headers(forwarded_headers(client_headers))
            .timeout(self.full_timeout)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        if status == 404 {
            return Err(ProxyError::UpstreamNotFound);
        }
        if status >= 500 {
            return Err(ProxyError::UpstreamServerError(status));
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_response_bytes {
                return Err(ProxyError::ResponseTooLarge(self.max_response_bytes));
            }
        }

        let headers = response.headers().clone();
        let content_type = content_type_of(&headers);

        // Stream the body so an unbounded upstream is aborted at the ceiling
        // instead of buffered whole.
        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_transport_error)?;
            if (body.len() + chunk.len()) as u64 > self.max_response_bytes {
                return Err(ProxyError::ResponseTooLarge(self.max_response_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(
            "Fetched {} ({} bytes, status {}, type {:?})",
            target,
            body.len(),
            status,
            content_type
        );

        Ok(UpstreamResponse {
            status,
            headers,
            body: body.freeze(),
            content_type,
        })
    }
}

#[async_trait]
impl Fetch for UpstreamFetcher {
    async fn fetch(
        &self,
        target: &Url,
        mode: FetchMode,
        client_headers: &HeaderMap,
    ) -> Result<UpstreamResponse, ProxyError> {
        match mode {
            FetchMode::Probe => self.probe(target).await,
            FetchMode::Full => self.full(target, client_headers).await,
        }
    }
}

/// Map a transport-level reqwest failure onto the proxy error taxonomy
fn map_transport_error(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTimeout
    } else if err.is_redirect() {
        ProxyError::UpstreamUnreachable("redirect limit exceeded".to_string())
    } else {
        ProxyError::UpstreamUnreachable(err.to_string())
    }
}

/// Extract the content-type header value, if any
fn content_type_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
