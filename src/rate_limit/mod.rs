//! Rate limiting module
//!
//! Per-client token buckets held in process memory, and the request gate
//! that consults them before a request reaches the QR API handlers.
//!
//! - Each client identity (its IP address by default) owns a bucket of
//!   `max_tokens` tokens; every admitted request spends one.
//! - Each whole `window_ms` elapsed since the bucket was last evaluated
//!   restores `max_tokens` tokens, capped at `max_tokens`.
//! - Rejected requests get `429 Too Many Requests` with `Retry-After` and
//!   `X-RateLimit-*` headers; admitted ones carry the `X-RateLimit-*` headers.
//!
//! # Example
//!
//! ```rust
//! use qrgate::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::new(5, 300_000));
//!
//! for _ in 0..5 {
//!     assert!(limiter.check_and_consume("1.2.3.4", 0).allowed);
//! }
//!
//! let decision = limiter.check_and_consume("1.2.3.4", 100);
//! assert!(!decision.allowed);
//! assert_eq!(decision.reset_at_ms, 300_100);
//! ```

pub mod clock;
pub mod limiter;
pub mod middleware;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{spawn_eviction_task, RateLimiter};
pub use middleware::{
    add_rate_limit_headers, client_identity, rate_limit_middleware, RateLimitGate,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use types::{Bucket, Decision, EvictionConfig, RateLimitConfig, DEFAULT_FALLBACK_IDENTITY};
