use std::time::Duration;

/// Configuration for the [`ActionConsumer`](crate::ActionConsumer).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Wall-clock budget for a single plugin `execute` call.
    pub execution_timeout: Duration,
    /// Maximum number of actions executing concurrently. Enforced via a
    /// `tokio::sync::Semaphore`; waiters queue FIFO.
    pub concurrency: usize,
    /// First-attempt backoff delay.
    pub base_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(60),
            concurrency: 10,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
        }
    }
}

/// Exponential backoff for attempt `n` (1-based):
/// `min(max, base * 2^(n-1))` milliseconds.
#[must_use]
pub fn backoff_delay_ms(config: &ConsumerConfig, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(31);
    config
        .base_backoff_ms
        .saturating_mul(1_u64 << shift)
        .min(config.max_backoff_ms)
}
