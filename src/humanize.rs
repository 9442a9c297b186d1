//! Basic humanization: randomized delays and user agents.
//!
//! Nothing here tries to defeat bot detection. It only avoids a perfectly
//! regular request cadence and a single fixed user agent string.

use std::time::Duration;

use rand::Rng;

/// Desktop user agents rotated across capture attempts and search requests.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
];

/// Pick a random user agent.
pub fn random_user_agent() -> &'static str {
    let idx = rand::rng().random_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}

/// Random duration in `[min_ms, max_ms]`. Returns `min_ms` when the range is empty.
pub fn random_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

/// Apply a symmetric jitter of up to `jitter` to `base`.
///
/// The result never drops below one second so a large jitter cannot turn a
/// schedule into a busy loop.
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let jitter_ms = jitter.as_millis() as i64;
    let offset = rand::rng().random_range(-jitter_ms..=jitter_ms);
    let ms = (base.as_millis() as i64 + offset).max(1_000);
    Duration::from_millis(ms as u64)
}
