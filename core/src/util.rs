use std::time::Duration;

use rand::Rng;

/// Exponential back-off schedule used by the reconnect loop and the
/// pre-stream transient-retry policy: 1s, 2s, 4s, ... capped at `cap`.
pub fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let scaled = base.saturating_mul(1u32 << shift);
    let capped = scaled.min(cap);
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((capped.as_millis() as f64 * jitter) as u64)
}

/// Expand a leading `~/` to the user's home directory; pass through
/// everything else unchanged (including bare `~` with no trailing slash,
/// which we deliberately do not expand).
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        for attempt in 1..10 {
            let d = backoff(attempt, base, cap);
            assert!(d <= Duration::from_millis((cap.as_millis() as f64 * 1.21) as u64));
        }
    }

    #[test]
    fn expand_home_only_with_trailing_slash() {
        assert_eq!(expand_home("relative/path"), "relative/path");
        assert_eq!(expand_home("~"), "~");
        assert!(expand_home("~/foo").ends_with("foo"));
    }
}
