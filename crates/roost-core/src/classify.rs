//! Failure classification and retry policy.
//!
//! Maps adapter failures onto [`ErrorKind`] and decides, per kind, whether
//! a job gets another attempt and when.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::to_chrono;
use crate::error::{AdapterError, AppError, ErrorKind, ScrapeError};
use crate::job::{Priority, ScrapeJob};

/// How many UNKNOWN failures a job may absorb before the next is terminal.
const UNKNOWN_RETRY_LIMIT: usize = 1;

/// Exponential backoff: `base * 2^attempts`, capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffConfig {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(20));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Map a raw adapter failure onto the shared taxonomy.
pub fn kind_of(error: &AdapterError) -> ErrorKind {
    match error {
        AdapterError::Network(_) => ErrorKind::NetworkError,
        AdapterError::Timeout(_) => ErrorKind::Timeout,
        AdapterError::RateLimited { .. } => ErrorKind::RateLimit,
        AdapterError::Blocked(_) => ErrorKind::Blocked,
        AdapterError::Parse(_) => ErrorKind::ParseError,
        AdapterError::InvalidData(_) => ErrorKind::InvalidData,
        AdapterError::Other(_) => ErrorKind::Unknown,
        AdapterError::HttpStatus { status, .. } => match status {
            429 => ErrorKind::RateLimit,
            403 => ErrorKind::Blocked,
            404 | 410 => ErrorKind::InvalidData,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::NetworkError,
            _ => ErrorKind::Unknown,
        },
    }
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    backoff: BackoffConfig,
    blocked_cooldown: Duration,
}

impl ErrorClassifier {
    pub fn new(backoff: BackoffConfig, blocked_cooldown: Duration) -> Self {
        Self {
            backoff,
            blocked_cooldown,
        }
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    /// Classify a failure of `job`'s current attempt.
    ///
    /// `job.errors` must not yet contain this failure; `job.attempts` must
    /// already count it.
    pub fn classify(&self, error: &AdapterError, job: &ScrapeJob, now: DateTime<Utc>) -> ScrapeError {
        let kind = kind_of(error);
        let backoff = self.backoff.delay_for(job.attempts);

        let (retryable, wait) = match kind {
            ErrorKind::NetworkError | ErrorKind::Timeout => (true, backoff),
            ErrorKind::RateLimit => {
                let hinted = match error {
                    AdapterError::RateLimited {
                        retry_after: Some(hint),
                    } => (*hint).max(backoff),
                    _ => backoff,
                };
                (true, hinted.min(self.backoff.cap))
            }
            ErrorKind::ParseError | ErrorKind::InvalidData => (true, backoff),
            ErrorKind::Blocked => (true, self.blocked_cooldown),
            ErrorKind::Unknown => (
                job.failures_of(ErrorKind::Unknown) < UNKNOWN_RETRY_LIMIT,
                backoff,
            ),
        };

        ScrapeError {
            kind,
            message: error.to_string(),
            source: job.source,
            url: job.url().map(str::to_string),
            retryable,
            retry_after: retryable.then(|| now + to_chrono(wait)),
        }
    }

    /// Failures outside the adapter (persisting the result) count as UNKNOWN.
    pub fn classify_store_error(
        &self,
        error: &AppError,
        job: &ScrapeJob,
        now: DateTime<Utc>,
    ) -> ScrapeError {
        self.classify(&AdapterError::Other(error.to_string()), job, now)
    }

    /// Priority a retried job goes back in at, if it changes.
    pub fn requeue_priority(kind: ErrorKind) -> Option<Priority> {
        match kind {
            ErrorKind::ParseError | ErrorKind::InvalidData => Some(Priority::Low),
            _ => None,
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(BackoffConfig::default(), Duration::from_secs(15 * 60))
    }
}
