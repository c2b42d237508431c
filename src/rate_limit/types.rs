use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identity used when a client address cannot be determined
pub const DEFAULT_FALLBACK_IDENTITY: &str = "anonymous";

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Enable the request gate
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Length of one refill interval (in milliseconds)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Bucket capacity, also the amount restored per elapsed window
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Path prefix the gate protects
    #[serde(default = "default_protected_prefix")]
    pub protected_prefix: String,
    /// Identity shared by clients whose address is unknown
    #[serde(default = "default_fallback_identity")]
    pub fallback_identity: String,
    /// Read the client address from X-Forwarded-For / X-Real-IP
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    /// Idle bucket eviction
    #[serde(default)]
    pub eviction: EvictionConfig,
}

/// Idle bucket eviction settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvictionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of whole windows a bucket must sit untouched before removal
    #[serde(default = "default_idle_windows")]
    pub idle_windows: u32,
}

fn default_true() -> bool {
    true
}

fn default_window_ms() -> u64 {
    300_000
}

fn default_max_tokens() -> u32 {
    5
}

fn default_protected_prefix() -> String {
    "/api/qr".to_string()
}

fn default_fallback_identity() -> String {
    DEFAULT_FALLBACK_IDENTITY.to_string()
}

fn default_idle_windows() -> u32 {
    1
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            idle_windows: default_idle_windows(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            window_ms: default_window_ms(),
            max_tokens: default_max_tokens(),
            protected_prefix: default_protected_prefix(),
            fallback_identity: default_fallback_identity(),
            trust_forwarded_headers: false,
            eviction: EvictionConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// Create a configuration with the given capacity and window, defaults elsewhere
    pub fn new(max_tokens: u32, window_ms: u64) -> Self {
        Self {
            max_tokens,
            window_ms,
            ..Default::default()
        }
    }

    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Configured idle period; the sweeper waits one more window on top of it
    pub fn idle_threshold_ms(&self) -> u64 {
        self.window_ms
            .saturating_mul(u64::from(self.eviction.idle_windows))
    }

    /// Whether `path` falls under the protected prefix.
    ///
    /// Matches on segment boundaries: with prefix `/api/qr`, `/api/qr` and
    /// `/api/qr/check-limit` are protected but `/api/qrcode` is not.
    pub fn protects(&self, path: &str) -> bool {
        let prefix = self.protected_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Per-identity token bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Remaining admissions, never above the configured capacity
    pub tokens: u32,
    /// Epoch milliseconds of the last recalculation
    pub last_refill_ms: u64,
}

impl Bucket {
    /// A full bucket first observed at `now_ms`
    pub fn full(max_tokens: u32, now_ms: u64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill_ms: now_ms,
        }
    }

    /// Restore tokens for every whole window elapsed since the last refill.
    ///
    /// The refill timestamp moves to `now_ms` on every call, so time left over
    /// from a partial window is discarded. A `now_ms` earlier than the last
    /// refill counts as zero elapsed time and leaves the timestamp untouched.
    pub fn refill(&mut self, now_ms: u64, window_ms: u64, max_tokens: u32) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        let windows = elapsed.checked_div(window_ms).unwrap_or(0);
        let restored = windows.saturating_mul(u64::from(max_tokens));
        let tokens = u64::from(self.tokens)
            .saturating_add(restored)
            .min(u64::from(max_tokens));

        // tokens <= max_tokens, which is a u32
        self.tokens = tokens as u32;
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }
}

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Tokens left after this check
    pub remaining: u32,
    /// Bucket capacity
    pub limit: u32,
    /// Milliseconds to wait before retrying (rejections only)
    pub retry_after_ms: Option<u64>,
    /// Absolute epoch milliseconds at which the window resets
    pub reset_at_ms: u64,
}

impl Decision {
    /// Create an admitted decision
    pub fn allowed(remaining: u32, limit: u32, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            retry_after_ms: None,
            reset_at_ms,
        }
    }

    /// Create a rejected decision
    pub fn denied(limit: u32, retry_after_ms: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            retry_after_ms: Some(retry_after_ms),
            reset_at_ms,
        }
    }

    /// Retry delay rounded up to whole seconds, for human-readable messages
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms
            .map(|ms| ms.div_ceil(1000))
            .unwrap_or(0)
    }
}
