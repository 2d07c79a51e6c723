//! Retry helpers shared by the adapters
//!
//! Exponential backoff with jitter; `Retry-After` is honoured when the
//! provider sends one. Retryability itself is classified by
//! [`LlmError::is_retryable`].

use std::time::Duration;

use rand::Rng;

/// Delay before the given retry attempt (1-based).
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter = rand::thread_rng().gen_range(0..250);
    exp + Duration::from_millis(jitter)
}

/// Parse a `Retry-After` header (seconds form only).
pub fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Default base delay between attempts.
pub const BASE_DELAY: Duration = Duration::from_millis(1_000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows() {
        let base = Duration::from_millis(100);
        let d1 = backoff_delay(1, base);
        let d3 = backoff_delay(3, base);
        assert!(d1 >= Duration::from_millis(100));
        assert!(d1 < Duration::from_millis(400));
        assert!(d3 >= Duration::from_millis(400));
        assert!(d3 < Duration::from_millis(700));
    }
}
