//! Configuration module with TOML parsing and validation
//!
//! All operational values are externalized - no hardcoded ports, limits, or
//! blocklists. Configuration is loaded once at startup and treated as
//! read-only for the lifetime of the process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server bind configuration
    pub server: ServerConfig,
    /// Outbound fetch configuration
    pub upstream: UpstreamConfig,
    /// Target validation (SSRF defense) configuration
    pub validation: ValidationConfig,
    /// Per-endpoint-class rate admission configuration
    pub rate_limit: RateLimitConfig,
    /// Content rewriting configuration
    pub rewrite: RewriteConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            validation: ValidationConfig::default(),
            rate_limit: RateLimitConfig::default(),
            rewrite: RewriteConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing file yields defaults
    /// with a warning so the proxy can run unconfigured in development.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Configuration file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        self.server
            .socket_addr()
            .map_err(|e| anyhow::anyhow!("invalid server bind address: {}", e))?;

        if self.upstream.max_response_bytes == 0 {
            anyhow::bail!("upstream.max_response_bytes must be non-zero");
        }
        if self.upstream.full_timeout_secs == 0 || self.upstream.probe_timeout_secs == 0 {
            anyhow::bail!("upstream timeouts must be non-zero");
        }

        if self.validation.max_url_length == 0 {
            anyhow::bail!("validation.max_url_length must be non-zero");
        }

        for (class, limit) in &self.rate_limit.classes {
            if limit.max_requests == 0 || limit.window_secs == 0 {
                anyhow::bail!("rate_limit.classes.{}: limits must be non-zero", class);
            }
        }

        url::Url::parse(&self.server.public_url)
            .map_err(|e| anyhow::anyhow!("invalid server.public_url: {}", e))?;

        Ok(())
    }
}

/// HTTP server bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_address: String,
    /// TCP port
    pub port: u16,
    /// Externally visible base URL of the proxy endpoint. Rewritten
    /// navigation and redirect targets route back through this URL.
    pub public_url: String,
    /// Production flag - suppresses internal error details in responses
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            public_url: "http://localhost:8080/proxy".to_string(),
            production: false,
        }
    }
}

impl ServerConfig {
    /// Get the socket address for binding
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

/// Outbound fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Overall timeout for full fetches (seconds)
    pub full_timeout_secs: u64,
    /// Timeout for probe (existence check) fetches (seconds)
    pub probe_timeout_secs: u64,
    /// Maximum redirect hops followed per fetch
    pub max_redirects: usize,
    /// Response size ceiling in bytes
    pub max_response_bytes: u64,
    /// User-agent presented to upstream servers
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            full_timeout_secs: 25,
            probe_timeout_secs: 5,
            max_redirects: 5,
            max_response_bytes: 50 * 1024 * 1024,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

/// Target validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Maximum accepted URL length
    pub max_url_length: usize,
    /// Operator-configured domain blocklist (substring match on hostname)
    pub blocked_domains: Vec<String>,
    /// Ports never fetched from, regardless of target
    pub blocked_ports: Vec<u16>,
    /// Additional suspicious-pattern regexes beyond the built-in set
    pub custom_patterns: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_url_length: 2048,
            blocked_domains: Vec::new(),
            blocked_ports: vec![22, 23, 25, 110, 135, 139, 445, 3389],
            custom_patterns: Vec::new(),
        }
    }
}

/// Fixed-window limit for one endpoint class
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowLimit {
    /// Maximum admitted requests per window
    pub max_requests: u32,
    /// Window duration (seconds)
    pub window_secs: u64,
}

impl Default for WindowLimit {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_secs: 60,
        }
    }
}

/// Rate admission configuration - one independent limiter per endpoint class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-class window limits, keyed by class name (proxy, chat, image)
    pub classes: HashMap<String, WindowLimit>,
    /// Sweep interval for stale client windows (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut classes = HashMap::new();
        classes.insert(
            "proxy".to_string(),
            WindowLimit {
                max_requests: 60,
                window_secs: 60,
            },
        );
        classes.insert(
            "chat".to_string(),
            WindowLimit {
                max_requests: 20,
                window_secs: 60,
            },
        );
        classes.insert(
            "image".to_string(),
            WindowLimit {
                max_requests: 10,
                window_secs: 60,
            },
        );
        Self {
            classes,
            sweep_interval_secs: 60,
        }
    }
}

/// Content rewriting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    /// URL of the fixed script injected into every rewritten page
    pub script_url: String,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            script_url: "/static/overlay.js".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON-formatted logs
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
