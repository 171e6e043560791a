//! Response-header sanitization
//!
//! Upstream headers pass through an allow/deny/transform policy before
//! re-emission. The deny-list strips framing and security policies that
//! would stop the page from rendering inside a different origin; the
//! preserve-list forwards caching and content metadata unchanged; `location`
//! is transformed to route redirects back through the proxy; everything else
//! is dropped (fail-closed). A fixed set of headers is always added so the
//! injected script loads cross-origin and proxied responses stay out of
//! search indexes.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::rewriter::RewriteContext;

/// Never forwarded, regardless of upstream content
const DENY_HEADERS: &[&str] = &[
    "x-frame-options",
    "content-security-policy",
    "content-security-policy-report-only",
    "x-content-security-policy",
    "x-webkit-csp",
    "strict-transport-security",
    "public-key-pins",
    "public-key-pins-report-only",
    "x-xss-protection",
    "x-content-type-options",
    "referrer-policy",
    "feature-policy",
    "permissions-policy",
    "cross-origin-embedder-policy",
    "cross-origin-opener-policy",
    "cross-origin-resource-policy",
    "x-permitted-cross-domain-policies",
    "set-cookie",
];

/// Forwarded unchanged
const PRESERVE_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-encoding",
    "cache-control",
    "expires",
    "last-modified",
    "etag",
    "content-language",
    "content-disposition",
];

/// Marker header identifying a proxied response
pub const PROXIED_BY_HEADER: &str = "x-proxied-by";

/// Map upstream response headers onto the outgoing policy. Multi-valued
/// headers are carried value by value.
pub fn sanitize(upstream: &HeaderMap, ctx: &RewriteContext) -> HeaderMap {
    let mut outgoing = HeaderMap::new();

    for name in upstream.keys() {
        let lower = name.as_str().to_ascii_lowercase();

        if DENY_HEADERS.contains(&lower.as_str()) {
            continue;
        }

        if lower == "location" {
            for value in upstream.get_all(name) {
                if let Ok(location) = value.to_str() {
                    let rewritten = ctx.rewrite_location(location);
                    match HeaderValue::from_str(&rewritten) {
                        Ok(value) => {
                            outgoing.append(HeaderName::from_static("location"), value);
                        }
                        Err(e) => warn!("Dropping unrepresentable location header: {}", e),
                    }
                }
            }
            continue;
        }

        if PRESERVE_HEADERS.contains(&lower.as_str()) {
            for value in upstream.get_all(name) {
                outgoing.append(name.clone(), value.clone());
            }
        }
        // Everything else is dropped by default
    }

    // Wide-open CORS so the injected script can be fetched cross-origin
    outgoing.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    outgoing.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    outgoing.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("Content-Type"),
    );

    // Keep proxied copies out of search indexes
    outgoing.insert(
        HeaderName::from_static("x-robots-tag"),
        HeaderValue::from_static("noindex, nofollow"),
    );
    outgoing.insert(
        HeaderName::from_static(PROXIED_BY_HEADER),
        HeaderValue::from_static(env!("CARGO_PKG_NAME")),
    );

    outgoing
}
