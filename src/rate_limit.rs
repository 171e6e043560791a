//! Per-client rate admission with fixed-window counters
//!
//! Each endpoint class (proxy, chat, image) owns an independent
//! `AdmissionController`; a client's standing in one class never affects
//! another. The per-key read-increment-compare sequence is serialized by the
//! DashMap entry lock - the only true mutual exclusion in the core. A
//! background sweep drops windows one full grace window after expiry so
//! memory stays bounded without blocking concurrent checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::debug;

use crate::config::{RateLimitConfig, WindowLimit};

/// Logical endpoint classes with independent admission budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Proxy,
    Chat,
    Image,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Chat => "chat",
            Self::Image => "image",
        }
    }
}

/// Result of one admission check
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub admitted: bool,
    /// Configured ceiling for this class
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// Absolute unix timestamp at which the window resets
    pub reset_at: u64,
    /// Seconds until retry is worthwhile, set only when rejected
    pub retry_after_secs: Option<u64>,
}

/// Fixed-window state for one client key
struct ClientWindow {
    count: u32,
    window_end: Instant,
    reset_epoch: u64,
}

/// Fixed-window admission controller for one endpoint class
pub struct AdmissionController {
    max_requests: u32,
    window: Duration,
    windows: DashMap<String, ClientWindow>,
}

impl AdmissionController {
    pub fn new(limit: WindowLimit) -> Self {
        Self {
            max_requests: limit.max_requests,
            window: Duration::from_secs(limit.window_secs),
            windows: DashMap::new(),
        }
    }

    /// Check and count one request for `key`. The entry lock serializes the
    /// read-increment-compare sequence for a single key; unrelated keys
    /// proceed in parallel.
    pub fn check(&self, key: &str) -> Admission {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| ClientWindow {
                count: 0,
                window_end: now + self.window,
                reset_epoch: epoch_secs_after(self.window),
            });
        let window = entry.value_mut();

        if now >= window.window_end {
            window.count = 0;
            window.window_end = now + self.window;
            window.reset_epoch = epoch_secs_after(self.window);
        }

        window.count += 1;
        let admitted = window.count <= self.max_requests;
        let remaining = self.max_requests.saturating_sub(window.count);
        let reset_at = window.reset_epoch;
        let retry_after_secs = if admitted {
            None
        } else {
            Some(
                window
                    .window_end
                    .saturating_duration_since(now)
                    .as_secs()
                    .max(1),
            )
        };

        Admission {
            admitted,
            limit: self.max_requests,
            remaining,
            reset_at,
            retry_after_secs,
        }
    }

    /// Remove windows that ended more than one full window ago. Runs shard
    /// by shard, so concurrent checks on untouched keys are not blocked.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let grace = self.window;
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now < window.window_end + grace);
        before - self.windows.len()
    }

    /// Number of currently tracked client keys
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

/// One admission controller per endpoint class
pub struct AdmissionRegistry {
    controllers: HashMap<EndpointClass, Arc<AdmissionController>>,
}

impl AdmissionRegistry {
    /// Build controllers from config; classes missing from the config fall
    /// back to the default window limit.
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut controllers = HashMap::new();
        for class in [EndpointClass::Proxy, EndpointClass::Chat, EndpointClass::Image] {
            let limit = config
                .classes
                .get(class.as_str())
                .copied()
                .unwrap_or_default();
            controllers.insert(class, Arc::new(AdmissionController::new(limit)));
        }
        Self { controllers }
    }

    pub fn get(&self, class: EndpointClass) -> Arc<AdmissionController> {
        // All classes are populated in new()
        Arc::clone(&self.controllers[&class])
    }

    /// Spawn the periodic sweep task covering every controller
    pub fn spawn_sweep_task(self: &Arc<Self>, interval: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for (class, controller) in &registry.controllers {
                    let removed = controller.sweep();
                    if removed > 0 {
                        debug!(
                            "Swept {} stale client windows from {} limiter",
                            removed,
                            class.as_str()
                        );
                    }
                }
            }
        });
    }
}

/// Unix timestamp `window` from now
fn epoch_secs_after(window: Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        + window.as_secs()
}
