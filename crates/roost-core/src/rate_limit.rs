//! Per-source request accounting.
//!
//! Each source gets a sliding window of request timestamps covering the last
//! hour, an in-flight counter and a minimum spacing between requests. The set
//! of sources is fixed when the limiter is built, so every source has its own
//! lock and probing one source never contends with another.
//!
//! Running out of budget is backpressure, not failure: callers keep the job
//! pending and come back after [`RateLimiter::next_available`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{to_chrono, until};
use crate::models::Source;

/// Hint returned while every concurrency slot is taken; a release will
/// normally wake the caller before this elapses.
const BUSY_RETRY: Duration = Duration::from_millis(250);

/// Request budget for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Minimum spacing between two consecutive requests.
    pub min_delay: Duration,
    /// Maximum number of requests in flight at once.
    pub max_concurrent: usize,
}

impl RateLimitConfig {
    pub fn new(requests_per_minute: u32, requests_per_hour: u32) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
            min_delay: Duration::ZERO,
            max_concurrent: 1,
        }
    }

    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    /// Limits each site tolerated in practice.
    pub fn for_source(source: Source) -> Self {
        match source {
            Source::Zillow => Self::new(5, 100)
                .with_min_delay(Duration::from_secs(5))
                .with_max_concurrent(2),
            Source::Redfin => Self::new(6, 120)
                .with_min_delay(Duration::from_secs(4))
                .with_max_concurrent(2),
            Source::HomesCom => Self::new(8, 150)
                .with_min_delay(Duration::from_secs(3))
                .with_max_concurrent(3),
        }
    }
}

impl Default for RateLimitConfig {
    /// Conservative: 5/min, 100/h, 5 s spacing, one request at a time.
    fn default() -> Self {
        Self::new(5, 100).with_min_delay(Duration::from_secs(5))
    }
}

/// Point-in-time view of one source's budget usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitUsage {
    pub last_minute: u32,
    pub last_hour: u32,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Window {
    /// Request start times within the last hour, oldest first.
    requests: VecDeque<DateTime<Utc>>,
    in_flight: usize,
}

impl Window {
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - chrono::Duration::hours(1);
        while self.requests.front().is_some_and(|t| *t <= horizon) {
            self.requests.pop_front();
        }
    }

    fn count_since(&self, since: DateTime<Utc>) -> u32 {
        self.requests.iter().rev().take_while(|t| **t > since).count() as u32
    }

    /// How long until a request at `now` would be admitted; zero if it is.
    fn wait(&self, config: &RateLimitConfig, now: DateTime<Utc>) -> Duration {
        let mut wait = Duration::ZERO;

        if self.in_flight >= config.max_concurrent {
            wait = wait.max(BUSY_RETRY);
        }

        if let Some(last) = self.requests.back() {
            wait = wait.max(until(now, *last + to_chrono(config.min_delay)));
        }

        for (span, limit) in [
            (chrono::Duration::minutes(1), config.requests_per_minute),
            (chrono::Duration::hours(1), config.requests_per_hour),
        ] {
            let in_window: Vec<&DateTime<Utc>> =
                self.requests.iter().filter(|t| **t > now - span).collect();
            if limit == 0 {
                wait = wait.max(until(now, now + span));
            } else if in_window.len() >= limit as usize {
                // The slot frees when the oldest request that keeps us at
                // the limit leaves the window.
                let idx = in_window.len() - limit as usize;
                wait = wait.max(until(now, *in_window[idx] + span));
            }
        }

        wait
    }
}

struct SourceLimiter {
    config: RateLimitConfig,
    window: Mutex<Window>,
}

/// Sliding-window rate limiter keyed by source.
///
/// Sources without a configuration are not limited.
#[derive(Clone)]
pub struct RateLimiter {
    sources: Arc<HashMap<Source, SourceLimiter>>,
}

impl RateLimiter {
    pub fn new(configs: impl IntoIterator<Item = (Source, RateLimitConfig)>) -> Self {
        let sources = configs
            .into_iter()
            .map(|(source, config)| {
                (
                    source,
                    SourceLimiter {
                        config,
                        window: Mutex::new(Window::default()),
                    },
                )
            })
            .collect();
        Self {
            sources: Arc::new(sources),
        }
    }

    /// Limiter with the per-site defaults for every known source.
    pub fn with_defaults() -> Self {
        Self::new(
            Source::ALL
                .into_iter()
                .map(|s| (s, RateLimitConfig::for_source(s))),
        )
    }

    pub fn config(&self, source: Source) -> Option<&RateLimitConfig> {
        self.sources.get(&source).map(|s| &s.config)
    }

    fn lock(&self, source: Source) -> Option<(&RateLimitConfig, MutexGuard<'_, Window>)> {
        let limiter = self.sources.get(&source)?;
        let guard = limiter.window.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(%source, "Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        });
        Some((&limiter.config, guard))
    }

    /// Would a request for `source` be allowed at `now`? Never mutates.
    pub fn admit(&self, source: Source, now: DateTime<Utc>) -> bool {
        match self.lock(source) {
            Some((config, window)) => window.wait(config, now).is_zero(),
            None => true,
        }
    }

    /// Record that a request for `source` started at `now`.
    ///
    /// Also takes one in-flight slot; pair with [`RateLimiter::release`].
    pub fn record_request(&self, source: Source, now: DateTime<Utc>) {
        if let Some((_, mut window)) = self.lock(source) {
            window.prune(now);
            window.requests.push_back(now);
            window.in_flight += 1;
        }
    }

    /// Admit and record in one step, so two callers can never both pass a
    /// check that only one of them fits into. On refusal returns how long to
    /// wait before trying again.
    pub fn try_acquire(&self, source: Source, now: DateTime<Utc>) -> Result<(), Duration> {
        let Some((config, mut window)) = self.lock(source) else {
            return Ok(());
        };
        window.prune(now);
        let wait = window.wait(config, now);
        if !wait.is_zero() {
            tracing::trace!(%source, wait_ms = wait.as_millis() as u64, "Rate limit deferred request");
            return Err(wait);
        }
        window.requests.push_back(now);
        window.in_flight += 1;
        Ok(())
    }

    /// Free the in-flight slot taken by `record_request`/`try_acquire`.
    pub fn release(&self, source: Source) {
        if let Some((_, mut window)) = self.lock(source) {
            window.in_flight = window.in_flight.saturating_sub(1);
        }
    }

    /// Time until a request for `source` would be admitted.
    pub fn next_available(&self, source: Source, now: DateTime<Utc>) -> Duration {
        match self.lock(source) {
            Some((config, window)) => window.wait(config, now),
            None => Duration::ZERO,
        }
    }

    pub fn usage(&self, source: Source, now: DateTime<Utc>) -> RateLimitUsage {
        match self.lock(source) {
            Some((_, window)) => RateLimitUsage {
                last_minute: window.count_since(now - chrono::Duration::minutes(1)),
                last_hour: window.count_since(now - chrono::Duration::hours(1)),
                in_flight: window.in_flight,
            },
            None => RateLimitUsage {
                last_minute: 0,
                last_hour: 0,
                in_flight: 0,
            },
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}
