//! Retry strategy with exponential backoff for transient cloud failures.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use hybridsync_common::CloudError;
use hybridsync_storage::CloudResult;

/// Longest server-requested pause honoured for a rate-limited call.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Decide what to do with an operation that failed after `attempts`
    /// previously scheduled retries.
    pub fn decide(&self, attempts: u32, err: &CloudError) -> RetryDecision {
        if !err.is_transient() || attempts >= self.max_retries {
            return RetryDecision::DeadLetter;
        }
        match err.retry_after() {
            Some(hint) => RetryDecision::Retry(hint.min(MAX_RETRY_AFTER)),
            None => RetryDecision::Retry(self.delay_for_attempt(attempts)),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Outcome of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Give up; the operation becomes terminally failed.
    DeadLetter,
}

/// Retry executor for running a cloud call inline with retry logic.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation, retrying transient failures per the config.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> CloudResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => match self.config.decide(attempt, &err) {
                    RetryDecision::DeadLetter => {
                        if attempt > 0 {
                            warn!("Operation failed after {} attempts: {}", attempt + 1, err);
                        }
                        return Err(err);
                    }
                    RetryDecision::Retry(delay) => {
                        attempt += 1;
                        warn!(
                            "Attempt {} failed: {}. Retrying in {:?}...",
                            attempt, err, delay
                        );
                        sleep(delay).await;
                    }
                },
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_secs(1));

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0);

        // 1 * 10^5 = 100000 seconds, capped at 10
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1000))
            .with_jitter(true);

        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_decide_by_error_class() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(100));

        assert_eq!(
            config.decide(0, &CloudError::Network("reset".into())),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            config.decide(2, &CloudError::Network("reset".into())),
            RetryDecision::Retry(Duration::from_millis(400))
        );
        assert_eq!(
            config.decide(0, &CloudError::Auth("expired".into())),
            RetryDecision::DeadLetter
        );
        assert_eq!(
            config.decide(0, &CloudError::Validation("bad row".into())),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn test_decide_exhausted() {
        let config = RetryConfig::new(3);
        assert_eq!(
            config.decide(3, &CloudError::Network("reset".into())),
            RetryDecision::DeadLetter
        );

        let never = RetryConfig::new(0);
        assert_eq!(
            never.decide(0, &CloudError::Network("reset".into())),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn test_decide_honours_retry_after() {
        let config = RetryConfig::new(3);
        let err = CloudError::RateLimit {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(
            config.decide(0, &err),
            RetryDecision::Retry(Duration::from_secs(7))
        );

        let huge = CloudError::RateLimit {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(86_400)),
        };
        assert_eq!(config.decide(0, &huge), RetryDecision::Retry(MAX_RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let executor = RetryExecutor::default();

        let result: CloudResult<i32> = executor.execute(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_on_network_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1));
        let executor = RetryExecutor::new(config);

        let result: CloudResult<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(CloudError::Network("Connection failed".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::default();

        let result: CloudResult<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(CloudError::Auth("token revoked".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(CloudError::Auth(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_retries_exceeded() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let config = RetryConfig::new(2).with_initial_delay(Duration::from_millis(1));
        let executor = RetryExecutor::new(config);

        let result: CloudResult<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(CloudError::Network("Always fails".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        // Initial + 2 retries = 3 attempts
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }
}
