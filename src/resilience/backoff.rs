//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `retry` (1-based). Zero when `base_ms` is zero.
pub fn calculate_backoff(retry: u32, base_ms: u64, max_ms: u64) -> Duration {
    if retry == 0 || base_ms == 0 {
        return Duration::ZERO;
    }

    let factor = 2u64.saturating_pow(retry - 1);
    let capped = base_ms.saturating_mul(factor).min(max_ms);

    // up to 10% extra so concurrent retries spread out
    let spread = capped / 10;
    let jitter = if spread > 0 {
        rand::thread_rng().gen_range(0..=spread)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}
