//! Target validation (SSRF defense)
//!
//! Classifies candidate URLs as allowed or blocked before any outbound
//! request is made. Checks run in a fixed order and short-circuit on the
//! first failure: length, parseability, scheme, local addresses, private
//! ranges, blocked ports, operator domain blocklist, suspicious patterns.
//!
//! Validation is pure string and address analysis - no DNS resolution, no
//! network I/O, never blocks.

use std::net::{Ipv4Addr, Ipv6Addr};

use regex::Regex;
use tracing::warn;
use url::{Host, Url};

use crate::config::ValidationConfig;

/// Why a target was rejected (or `Allowed` when it was not)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    Allowed,
    TooLong,
    BadFormat,
    BadScheme,
    LocalAddress,
    PrivateAddress,
    BlockedPort,
    BlockedDomain,
    SuspiciousPattern,
}

/// Outcome of validating one candidate URL
#[derive(Debug, Clone)]
pub struct ValidationVerdict {
    pub allowed: bool,
    pub reason: ReasonCode,
    pub message: String,
}

impl ValidationVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: ReasonCode::Allowed,
            message: String::new(),
        }
    }

    fn block(reason: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason,
            message: message.into(),
        }
    }
}

/// Hostnames that always resolve to the local machine
const LOCAL_HOSTNAMES: &[&str] = &["localhost", "127.0.0.1", "0.0.0.0", "::1", "[::1]"];

/// Built-in suspicious-pattern signatures. Defense-in-depth on top of the
/// scheme and address checks, not a substitute for them.
const BUILTIN_PATTERNS: &[&str] = &[
    r"(?i)javascript\s*:",
    r"(?i)vbscript\s*:",
    r"(?i)data\s*:\s*text/html",
    r"(?i)\bon(error|load|click|mouseover|focus)\s*=",
    r"(?i)<\s*script[^>]*>",
];

/// Compiled target validator
pub struct TargetValidator {
    max_url_length: usize,
    blocked_domains: Vec<String>,
    blocked_ports: Vec<u16>,
    suspicious_patterns: Vec<Regex>,
}

impl TargetValidator {
    /// Build a validator from config, compiling all patterns at construction
    pub fn new(config: &ValidationConfig) -> Self {
        let mut suspicious_patterns = compile_patterns(BUILTIN_PATTERNS);
        suspicious_patterns.extend(config.custom_patterns.iter().filter_map(|p| {
            Regex::new(p)
                .map_err(|e| warn!("Invalid custom validation pattern '{}': {}", p, e))
                .ok()
        }));

        Self {
            max_url_length: config.max_url_length,
            blocked_domains: config
                .blocked_domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            blocked_ports: config.blocked_ports.clone(),
            suspicious_patterns,
        }
    }

    /// Classify a candidate URL. Checks short-circuit on first failure.
    pub fn validate(&self, raw: &str) -> ValidationVerdict {
        if raw.is_empty() {
            return ValidationVerdict::block(ReasonCode::BadFormat, "URL must not be empty");
        }
        if raw.len() > self.max_url_length {
            return ValidationVerdict::block(
                ReasonCode::TooLong,
                format!("URL exceeds {} characters", self.max_url_length),
            );
        }

        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(_) => {
                return ValidationVerdict::block(
                    ReasonCode::BadFormat,
                    "URL is not a valid absolute URL",
                );
            }
        };

        // Url::parse lowercases schemes, so this also covers mixed case.
        // Protocol-relative forms fail the absolute parse above.
        if url.scheme() != "http" && url.scheme() != "https" {
            return ValidationVerdict::block(
                ReasonCode::BadScheme,
                format!("Scheme '{}' is not allowed", url.scheme()),
            );
        }

        let host = match url.host() {
            Some(host) => host,
            None => {
                return ValidationVerdict::block(ReasonCode::BadFormat, "URL has no hostname");
            }
        };

        if let Some(verdict) = self.check_host(&host) {
            return verdict;
        }

        if let Some(port) = url.port() {
            // Port 0 is never a valid destination
            if port == 0 || self.blocked_ports.contains(&port) {
                return ValidationVerdict::block(
                    ReasonCode::BlockedPort,
                    format!("Port {} is not allowed", port),
                );
            }
        }

        let host_lower = host.to_string().to_ascii_lowercase();
        if self
            .blocked_domains
            .iter()
            .any(|blocked| host_lower.contains(blocked))
        {
            return ValidationVerdict::block(
                ReasonCode::BlockedDomain,
                "Domain is blocked by operator policy",
            );
        }

        for pattern in &self.suspicious_patterns {
            if pattern.is_match(raw) {
                return ValidationVerdict::block(
                    ReasonCode::SuspiciousPattern,
                    "URL matches a suspicious pattern",
                );
            }
        }

        ValidationVerdict::allow()
    }

    /// Local-address and private-range checks on the parsed host
    fn check_host(&self, host: &Host<&str>) -> Option<ValidationVerdict> {
        match host {
            Host::Domain(name) => {
                let lower = name.to_ascii_lowercase();
                if LOCAL_HOSTNAMES.contains(&lower.as_str()) {
                    return Some(ValidationVerdict::block(
                        ReasonCode::LocalAddress,
                        "Local addresses are not allowed",
                    ));
                }
                None
            }
            Host::Ipv4(addr) => self.check_ipv4(*addr),
            Host::Ipv6(addr) => self.check_ipv6(*addr),
        }
    }

    fn check_ipv4(&self, addr: Ipv4Addr) -> Option<ValidationVerdict> {
        if addr.is_loopback() || addr.is_unspecified() {
            return Some(ValidationVerdict::block(
                ReasonCode::LocalAddress,
                "Local addresses are not allowed",
            ));
        }
        // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16 via is_private;
        // 169.254.0.0/16 via is_link_local
        if addr.is_private() || addr.is_link_local() {
            return Some(ValidationVerdict::block(
                ReasonCode::PrivateAddress,
                "Private network addresses are not allowed",
            ));
        }
        None
    }

    fn check_ipv6(&self, addr: Ipv6Addr) -> Option<ValidationVerdict> {
        if addr.is_loopback() || addr.is_unspecified() {
            return Some(ValidationVerdict::block(
                ReasonCode::LocalAddress,
                "Local addresses are not allowed",
            ));
        }
        let segments = addr.segments();
        let unique_local = segments[0] & 0xfe00 == 0xfc00; // fc00::/7
        let link_local = segments[0] & 0xffc0 == 0xfe80; // fe80::/10
        if unique_local || link_local {
            return Some(ValidationVerdict::block(
                ReasonCode::PrivateAddress,
                "Private network addresses are not allowed",
            ));
        }
        // IPv4-mapped addresses inherit the IPv4 classification
        if let Some(v4) = addr.to_ipv4_mapped() {
            return self.check_ipv4(v4);
        }
        None
    }
}

/// Compile a slice of regex pattern strings, logging failures
fn compile_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            Regex::new(p)
                .map_err(|e| warn!("Failed to compile validation pattern '{}': {}", p, e))
                .ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;

    fn validator() -> TargetValidator {
        TargetValidator::new(&ValidationConfig::default())
    }

    #[test]
    fn allows_public_https_url() {
        let verdict = validator().validate("https://example.com/page");
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, ReasonCode::Allowed);
    }

    #[test]
    fn rejects_empty_and_overlong() {
        let v = validator();
        assert_eq!(v.validate("").reason, ReasonCode::BadFormat);

        let long = format!("https://example.com/{}", "a".repeat(2100));
        assert_eq!(v.validate(&long).reason, ReasonCode::TooLong);
    }

    #[test]
    fn overlong_beats_other_checks() {
        // TOO_LONG regardless of otherwise-valid structure
        let long = format!("https://example.com/{}", "a".repeat(3000));
        let verdict = validator().validate(&long);
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, ReasonCode::TooLong);
    }

    #[test]
    fn rejects_bad_schemes() {
        let v = validator();
        for raw in [
            "ftp://example.com/",
            "file:///etc/passwd",
            "gopher://example.com/",
            "javascript:alert(1)",
        ] {
            let verdict = v.validate(raw);
            assert!(!verdict.allowed, "{} should be rejected", raw);
            assert_eq!(verdict.reason, ReasonCode::BadScheme, "{}", raw);
        }
        // Protocol-relative form is not an absolute URL
        assert_eq!(v.validate("//example.com/x").reason, ReasonCode::BadFormat);
    }

    #[test]
    fn scheme_check_is_case_insensitive() {
        let verdict = validator().validate("HTTPS://example.com/");
        assert!(verdict.allowed);
        let verdict = validator().validate("JAVASCRIPT:alert(1)");
        assert_eq!(verdict.reason, ReasonCode::BadScheme);
    }

    #[test]
    fn rejects_local_addresses() {
        let v = validator();
        for raw in [
            "http://localhost/",
            "http://localhost:3000/admin",
            "http://127.0.0.1/",
            "http://0.0.0.0/",
            "http://[::1]/",
        ] {
            let verdict = v.validate(raw);
            assert!(!verdict.allowed, "{} should be rejected", raw);
            assert_eq!(verdict.reason, ReasonCode::LocalAddress, "{}", raw);
        }
    }

    #[test]
    fn rejects_private_ranges() {
        let v = validator();
        for raw in [
            "http://10.0.0.1/",
            "http://10.255.255.254/",
            "http://172.16.0.1/",
            "http://172.31.255.1/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data/",
            "http://[fc00::1]/",
            "http://[fd12:3456::1]/",
            "http://[fe80::1]/",
        ] {
            let verdict = v.validate(raw);
            assert!(!verdict.allowed, "{} should be rejected", raw);
            assert_eq!(verdict.reason, ReasonCode::PrivateAddress, "{}", raw);
        }
        // Adjacent public ranges stay allowed
        assert!(v.validate("http://172.32.0.1/").allowed);
        assert!(v.validate("http://11.0.0.1/").allowed);
    }

    #[test]
    fn rejects_blocked_ports() {
        let v = validator();
        for raw in [
            "http://example.com:22/",
            "http://example.com:25/",
            "http://example.com:3389/",
        ] {
            assert_eq!(v.validate(raw).reason, ReasonCode::BlockedPort, "{}", raw);
        }
        assert!(v.validate("http://example.com:8080/").allowed);
    }

    #[test]
    fn rejects_port_zero() {
        let verdict = validator().validate("http://example.com:0/");
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, ReasonCode::BlockedPort);
    }

    #[test]
    fn blocked_domain_substring_match() {
        let config = ValidationConfig {
            blocked_domains: vec!["evil.example".to_string()],
            ..ValidationConfig::default()
        };
        let v = TargetValidator::new(&config);
        assert_eq!(
            v.validate("https://sub.evil.example/page").reason,
            ReasonCode::BlockedDomain
        );
        assert!(v.validate("https://good.example/page").allowed);
    }

    #[test]
    fn suspicious_patterns_in_query() {
        let v = validator();
        let verdict = v.validate("https://example.com/?q=%3Cscript%3E<script>alert(1)</script>");
        assert_eq!(verdict.reason, ReasonCode::SuspiciousPattern);
    }

    #[test]
    fn check_order_local_before_port() {
        // localhost with a blocked port reports the address, not the port
        let verdict = validator().validate("http://127.0.0.1:22/");
        assert_eq!(verdict.reason, ReasonCode::LocalAddress);
    }
}
