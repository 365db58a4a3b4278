//! Retry policy for pipeline jobs

use std::time::Duration;

use onair_core::{JobError, WorkerSettings};

/// Fixed-delay retries for transient faults and soft-time-limit expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    pub delay: Duration,
    pub soft_time_limit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(30),
            soft_time_limit: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            delay: Duration::from_secs(settings.retry_delay_secs),
            soft_time_limit: Duration::from_secs(settings.soft_time_limit_secs),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether `attempt` (1-based) failing with `error` earns another attempt.
    pub fn should_retry(&self, attempt: u32, error: &JobError) -> bool {
        error.is_retryable() && attempt < self.max_attempts()
    }

    pub fn timeout_error(&self) -> JobError {
        JobError::transient(anyhow::anyhow!(
            "Job exceeded soft time limit of {}s",
            self.soft_time_limit.as_secs()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_faults_get_two_extra_attempts() {
        let policy = RetryPolicy::default();
        let err = JobError::transient(anyhow::anyhow!("db blip"));
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
    }

    #[test]
    fn terminal_faults_never_retry() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(1, &JobError::content(anyhow::anyhow!("exit 1"))));
        assert!(!policy.should_retry(1, &JobError::integrity(anyhow::anyhow!("no session"))));
        assert!(!policy.should_retry(
            1,
            &JobError::configuration(anyhow::anyhow!("no ffmpeg"))
        ));
    }

    #[test]
    fn timeout_is_retryable() {
        let policy = RetryPolicy {
            soft_time_limit: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        let err = policy.timeout_error();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(1, &JobError::transient(anyhow::anyhow!("x"))));
    }
}
