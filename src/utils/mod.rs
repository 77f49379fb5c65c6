use std::time::{Duration, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::info;

/// A simple wall-clock timer for logging elapsed time.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("⏱  Starting: {}", label);
        Self {
            label,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!(
            "⏱  Finished: {} (took {:.2?})",
            self.label,
            self.start.elapsed()
        );
    }
}

/// Jittered exponential delays: `base_ms`, then doubling, capped at 30s,
/// `retries` of them.
pub fn backoff(base_ms: u64, retries: u32) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor((base_ms / 2).max(1))
        .max_delay(Duration::from_secs(30))
        .map(jitter)
        .take(retries as usize)
}

/// Insert `sep` every three digits from the right of an unsigned digit string.
pub fn group_digits(digits: &str, sep: char) -> String {
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(sep);
        }
        result.push(ch);
    }
    result.chars().rev().collect()
}

/// Format a count with thousands separators for console output.
pub fn fmt_number(n: u64) -> String {
    group_digits(&n.to_string(), ',')
}
