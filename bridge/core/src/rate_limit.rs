//! Per-Source Rate Limiting
//!
//! Fixed-window admission control for client task requests. Each source key
//! (the client's IP address in the daemon) gets a window that counts requests
//! until its reset time passes; the window is replaced lazily on the first
//! request after that.
//!
//! # Usage
//!
//! ```
//! use bridge_core::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default().with_max_requests(2));
//! assert!(limiter.admit("10.0.0.1").is_admitted());
//! assert!(limiter.admit("10.0.0.1").is_admitted());
//! assert!(limiter.admit("10.0.0.1").is_rejected());
//! assert!(limiter.admit("10.0.0.2").is_admitted());
//! ```
//!
//! Expired windows are also removed by [`RateLimiter::spawn_sweeper`] so the
//! map does not grow with every source ever seen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for request rate limiting
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window per source
    pub max_requests: u32,

    /// Window length
    pub window: Duration,

    /// How often expired windows are swept
    pub sweep_interval: Duration,

    /// Whether to enable rate limiting (can be disabled for testing)
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-window request budget
    #[must_use]
    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests = max;
        self
    }

    /// Set the window length
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the sweep interval
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Enable or disable rate limiting
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Create a disabled configuration (for testing)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// =============================================================================
// Admission Result
// =============================================================================

/// Outcome of an admission check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request admitted
    Admitted {
        /// Requests left in the current window
        remaining: u32,
    },

    /// Request rejected
    Rejected {
        /// Time until the window resets
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// Check if the request was admitted
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    /// Check if the request was rejected
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Time until reset, for rejections
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Rejected { retry_after } => Some(*retry_after),
            Self::Admitted { .. } => None,
        }
    }
}

// =============================================================================
// Limiter
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window rate limiter keyed by source
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, RateWindow>>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and count a request from `key` at the current time
    pub fn admit(&self, key: &str) -> RateLimitResult {
        self.admit_at(key, Instant::now())
    }

    /// Check and count a request from `key` at `now`
    pub fn admit_at(&self, key: &str, now: Instant) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Admitted {
                remaining: self.config.max_requests,
            };
        }

        let result = {
            let mut windows = self.windows.lock();
            let window = windows.entry(key.to_string()).or_insert(RateWindow {
                count: 0,
                reset_at: now + self.config.window,
            });

            if now >= window.reset_at {
                *window = RateWindow {
                    count: 0,
                    reset_at: now + self.config.window,
                };
            }

            if window.count >= self.config.max_requests {
                RateLimitResult::Rejected {
                    retry_after: window.reset_at.saturating_duration_since(now),
                }
            } else {
                window.count += 1;
                RateLimitResult::Admitted {
                    remaining: self.config.max_requests - window.count,
                }
            }
        };

        if result.is_admitted() {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(source = %key, "Request rate limited");
        }
        result
    }

    /// Remove windows whose reset time has passed
    ///
    /// Returns the number of windows removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Remove windows whose reset time is at or before `now`
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| window.reset_at > now);
        before - windows.len()
    }

    /// Number of tracked source windows
    #[must_use]
    pub fn tracked_sources(&self) -> usize {
        self.windows.lock().len()
    }

    /// Aggregate counters
    #[must_use]
    pub fn metrics(&self) -> RateLimitMetrics {
        RateLimitMetrics {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            tracked_sources: self.tracked_sources(),
        }
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `shutdown` flips
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.config.sweep_interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired rate limit windows");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Rate limit sweeper stopped");
        })
    }
}

/// Aggregate rate limiter counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitMetrics {
    /// Requests admitted since start
    pub admitted: u64,
    /// Requests rejected since start
    pub rejected: u64,
    /// Source windows currently tracked
    pub tracked_sources: usize,
}
