use std::time::Duration;

use crate::error::JobError;

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Another attempt may succeed; schedule one if budget remains.
    Retryable,
    /// Retrying cannot help; fail the job now.
    Fatal,
}

/// Classify an execution error for the retry controller.
///
/// Only transient provider failures and storage hiccups earn another
/// attempt. Validation problems, provider rejections, and time limits
/// fail identically every time, and cancellation is handled before the
/// controller ever sees it.
pub fn classify(err: &JobError) -> Disposition {
    match err {
        JobError::ProviderTransient(_) | JobError::Storage(_) => Disposition::Retryable,
        JobError::Validation(_)
        | JobError::ProviderFatal(_)
        | JobError::Timeout(_)
        | JobError::Cancelled
        | JobError::Conflict(_) => Disposition::Fatal,
    }
}

/// Exponential backoff schedule for retried jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt. Zero means fail on the
    /// first error.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1),
    /// capped at the ceiling.
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32);
        let delay = self.backoff_base.saturating_mul(1u32 << exp.min(31));
        delay.min(self.backoff_ceiling)
    }

    pub fn budget_remaining(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_ceiling: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.next_delay(1), Duration::from_secs(2));
        assert_eq!(p.next_delay(2), Duration::from_secs(4));
        assert_eq!(p.next_delay(3), Duration::from_secs(8));
        assert_eq!(p.next_delay(4), Duration::from_secs(10));
        assert_eq!(p.next_delay(20), Duration::from_secs(10));
    }

    #[test]
    fn budget() {
        let p = policy();
        assert!(p.budget_remaining(0));
        assert!(p.budget_remaining(2));
        assert!(!p.budget_remaining(3));

        let none = RetryPolicy { max_retries: 0, ..p };
        assert!(!none.budget_remaining(0));
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&JobError::ProviderTransient("x".into())), Disposition::Retryable);
        assert_eq!(classify(&JobError::Storage("x".into())), Disposition::Retryable);
        assert_eq!(classify(&JobError::ProviderFatal("x".into())), Disposition::Fatal);
        assert_eq!(classify(&JobError::Validation("x".into())), Disposition::Fatal);
        assert_eq!(classify(&JobError::Timeout("x".into())), Disposition::Fatal);
        assert_eq!(classify(&JobError::Cancelled), Disposition::Fatal);
    }
}
