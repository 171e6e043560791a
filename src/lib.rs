//! Siteproxy - Rewriting Web Proxy
//!
//! A same-origin gateway that:
//! - Fetches pages on behalf of clients and serves them from its own origin
//! - Rewrites HTML and CSS so relative references resolve against the target
//! - Injects an overlay script exactly once per proxied document
//! - Validates every target URL against an SSRF policy before any fetch
//! - Applies per-client fixed-window rate admission per endpoint class
//! - Sanitizes upstream response headers through an allow/deny/transform policy

pub mod config;
pub mod error;
pub mod fetcher;
pub mod headers;
pub mod rate_limit;
pub mod rewriter;
pub mod server;
pub mod validator;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{ErrorBody, ProxyError};
pub use fetcher::{Fetch, FetchMode, UpstreamFetcher, UpstreamResponse};
pub use headers::sanitize;
pub use rate_limit::{Admission, AdmissionController, AdmissionRegistry, EndpointClass};
pub use rewriter::{rewrite, RewriteContext, RewriteOutcome};
pub use server::{router, AppState};
pub use validator::{ReasonCode, TargetValidator, ValidationVerdict};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
