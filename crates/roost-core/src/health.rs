//! Per-source health read model.
//!
//! Tracks a rolling window of scrape outcomes for every source and suspends
//! a source after repeated bot-wall hits.
//!
//! # Source States
//!
//! ```text
//! HEALTHY <--[error rate drops]--> DEGRADED
//!    |                                 |
//!    +--[N consecutive BLOCKED]--> SUSPENDED --[cool-down elapsed]--> HEALTHY / DEGRADED
//! ```
//!
//! Suspension expires lazily: the first read after the cool-down clears it,
//! the same way the Open state of a circuit breaker turns half-open on the
//! next call. Apart from [`HealthMonitor::is_suspended`] nothing here makes
//! dispatch decisions.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::to_chrono;
use crate::error::{ErrorKind, ScrapeError};
use crate::models::Source;

/// Number of recent errors kept per source.
pub const RECENT_ERROR_LIMIT: usize = 10;

/// Blocked URLs remembered per source; the oldest entry is evicted first.
pub const BLOCKED_URL_LIMIT: usize = 500;

// System-wide thresholds over the health window, across all sources.
const DEGRADED_ERRORS: usize = 50;
const CRITICAL_ERRORS: usize = 100;
const DEGRADED_BLOCKED_URLS: usize = 20;
const CRITICAL_BLOCKED_URLS: usize = 50;
const RATE_LIMIT_ADVICE_AT: usize = 10;
const BLOCKED_ADVICE_AT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Suspended,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// Overall state of the pipeline, across sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemStatus::Healthy => write!(f, "healthy"),
            SystemStatus::Degraded => write!(f, "degraded"),
            SystemStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Configuration for health tracking and suspension.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Outcomes older than this no longer count toward the error rate.
    pub window: Duration,

    /// Consecutive BLOCKED outcomes that suspend a source.
    pub suspend_threshold: u32,

    /// How long a suspension lasts.
    pub suspend_cooldown: Duration,

    /// Error rate at or above which a source is reported degraded.
    pub degraded_error_rate: f64,

    /// Outcomes needed in the window before the error rate means anything.
    pub min_samples: usize,

    /// Delay before a BLOCKED job may be retried.
    pub blocked_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            suspend_threshold: 3,
            suspend_cooldown: Duration::from_secs(15 * 60),
            degraded_error_rate: 0.5,
            min_samples: 5,
            blocked_cooldown: Duration::from_secs(15 * 60),
        }
    }
}

impl HealthConfig {
    pub fn with_suspend_threshold(mut self, n: u32) -> Self {
        self.suspend_threshold = n.max(1);
        self
    }

    pub fn with_suspend_cooldown(mut self, cooldown: Duration) -> Self {
        self.suspend_cooldown = cooldown;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_degraded_error_rate(mut self, rate: f64, min_samples: usize) -> Self {
        self.degraded_error_rate = rate;
        self.min_samples = min_samples;
        self
    }

    pub fn with_blocked_cooldown(mut self, cooldown: Duration) -> Self {
        self.blocked_cooldown = cooldown;
        self
    }
}

/// One remembered failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentError {
    pub kind: ErrorKind,
    pub message: String,
    pub url: Option<String>,
    pub at: DateTime<Utc>,
}

/// Health of one source as of a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: Source,
    pub status: HealthStatus,
    /// Failures / outcomes within the window; 0.0 when there were none.
    pub error_rate: f64,
    pub outcomes_in_window: usize,
    pub consecutive_blocked: u32,
    pub blocked_count: usize,
    pub suspended_until: Option<DateTime<Utc>>,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    pub recent_errors: Vec<RecentError>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Aggregate health of every source within the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: SystemStatus,
    /// Failures / outcomes within the window over all sources.
    pub error_rate: f64,
    pub errors_in_window: usize,
    pub outcomes_in_window: usize,
    pub blocked_url_count: usize,
    pub suspended_sources: Vec<Source>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Default)]
struct SourceState {
    /// `(timestamp, failure kind)` within the window, oldest first.
    outcomes: VecDeque<(DateTime<Utc>, Option<ErrorKind>)>,
    consecutive_blocked: u32,
    suspended_until: Option<DateTime<Utc>>,
    /// URL -> when it was last blocked.
    blocked_urls: HashMap<String, DateTime<Utc>>,
    errors_by_kind: BTreeMap<ErrorKind, u64>,
    recent_errors: VecDeque<RecentError>,
    last_success_at: Option<DateTime<Utc>>,
}

/// Thread-safe health tracker for every source.
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    sources: Arc<HashMap<Source, Mutex<SourceState>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let sources = Source::ALL
            .into_iter()
            .map(|s| (s, Mutex::new(SourceState::default())))
            .collect();
        Self {
            config,
            sources: Arc::new(sources),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Acquires the per-source lock, recovering from poison if necessary.
    fn lock(&self, source: Source) -> Option<MutexGuard<'_, SourceState>> {
        let state = self.sources.get(&source)?;
        Some(state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(%source, "Recovered from poisoned health mutex");
            poisoned.into_inner()
        }))
    }

    pub fn record_success(&self, source: Source, url: Option<&str>, now: DateTime<Utc>) {
        let Some(mut state) = self.lock(source) else {
            return;
        };
        self.prune(&mut state, now);
        state.outcomes.push_back((now, None));
        state.consecutive_blocked = 0;
        state.last_success_at = Some(now);
        if let Some(url) = url
            && state.blocked_urls.remove(url).is_some()
        {
            tracing::debug!(%source, %url, "URL unblocked after successful scrape");
        }
    }

    pub fn record_failure(&self, error: &ScrapeError, now: DateTime<Utc>) {
        let source = error.source;
        let Some(mut state) = self.lock(source) else {
            return;
        };
        self.prune(&mut state, now);
        self.maybe_end_suspension(source, &mut state, now);

        state.outcomes.push_back((now, Some(error.kind)));
        *state.errors_by_kind.entry(error.kind).or_insert(0) += 1;
        state.recent_errors.push_back(RecentError {
            kind: error.kind,
            message: error.message.clone(),
            url: error.url.clone(),
            at: now,
        });
        while state.recent_errors.len() > RECENT_ERROR_LIMIT {
            state.recent_errors.pop_front();
        }

        if error.kind != ErrorKind::Blocked {
            state.consecutive_blocked = 0;
            return;
        }

        if let Some(url) = &error.url {
            state.blocked_urls.insert(url.clone(), now);
            if state.blocked_urls.len() > BLOCKED_URL_LIMIT
                && let Some(oldest) = state
                    .blocked_urls
                    .iter()
                    .min_by_key(|(_, at)| **at)
                    .map(|(url, _)| url.clone())
            {
                state.blocked_urls.remove(&oldest);
            }
        }
        state.consecutive_blocked += 1;

        if state.consecutive_blocked >= self.config.suspend_threshold
            && state.suspended_until.is_none()
        {
            let until = now + to_chrono(self.config.suspend_cooldown);
            tracing::warn!(
                %source,
                consecutive_blocked = state.consecutive_blocked,
                suspended_until = %until,
                "Suspending source after repeated bot-wall responses"
            );
            state.suspended_until = Some(until);
        }
    }

    /// Whether dispatch for `source` is halted at `now`.
    pub fn is_suspended(&self, source: Source, now: DateTime<Utc>) -> bool {
        self.suspended_until(source, now).is_some()
    }

    pub fn suspended_until(&self, source: Source, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut state = self.lock(source)?;
        self.maybe_end_suspension(source, &mut state, now);
        state.suspended_until
    }

    pub fn snapshot(&self, source: Source, now: DateTime<Utc>) -> SourceHealth {
        let Some(mut state) = self.lock(source) else {
            return SourceHealth {
                source,
                status: HealthStatus::Healthy,
                error_rate: 0.0,
                outcomes_in_window: 0,
                consecutive_blocked: 0,
                blocked_count: 0,
                suspended_until: None,
                errors_by_kind: BTreeMap::new(),
                recent_errors: Vec::new(),
                last_success_at: None,
            };
        };
        self.prune(&mut state, now);
        self.maybe_end_suspension(source, &mut state, now);

        let total = state.outcomes.len();
        let failures = state.outcomes.iter().filter(|(_, kind)| kind.is_some()).count();
        let error_rate = if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        };

        let status = if state.suspended_until.is_some() {
            HealthStatus::Suspended
        } else if total >= self.config.min_samples && error_rate >= self.config.degraded_error_rate
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        SourceHealth {
            source,
            status,
            error_rate,
            outcomes_in_window: total,
            consecutive_blocked: state.consecutive_blocked,
            blocked_count: state.blocked_urls.len(),
            suspended_until: state.suspended_until,
            errors_by_kind: state.errors_by_kind.clone(),
            recent_errors: state.recent_errors.iter().cloned().collect(),
            last_success_at: state.last_success_at,
        }
    }

    pub fn is_url_blocked(&self, source: Source, url: &str) -> bool {
        self.lock(source)
            .is_some_and(|state| state.blocked_urls.contains_key(url))
    }

    pub fn unblock_url(&self, source: Source, url: &str) -> bool {
        self.lock(source)
            .is_some_and(|mut state| state.blocked_urls.remove(url).is_some())
    }

    pub fn clear_blocked(&self, source: Source) {
        if let Some(mut state) = self.lock(source) {
            state.blocked_urls.clear();
        }
    }

    /// Forget everything recorded for `source`, including a suspension.
    pub fn reset(&self, source: Source) {
        if let Some(mut state) = self.lock(source) {
            tracing::info!(%source, "Source health manually reset");
            *state = SourceState::default();
        }
    }

    /// Aggregate view over every source, with operator advice.
    pub fn system_health(&self, now: DateTime<Utc>) -> SystemHealth {
        let mut outcomes = 0;
        let mut errors = 0;
        let mut rate_limited = 0;
        let mut blocked = 0;
        let mut blocked_url_count = 0;
        let mut suspended_sources = Vec::new();

        for source in Source::ALL {
            let Some(mut state) = self.lock(source) else {
                continue;
            };
            self.prune(&mut state, now);
            self.maybe_end_suspension(source, &mut state, now);

            outcomes += state.outcomes.len();
            for kind in state.outcomes.iter().filter_map(|(_, kind)| *kind) {
                errors += 1;
                match kind {
                    ErrorKind::RateLimit => rate_limited += 1,
                    ErrorKind::Blocked => blocked += 1,
                    _ => {}
                }
            }
            blocked_url_count += state.blocked_urls.len();
            if state.suspended_until.is_some() {
                suspended_sources.push(source);
            }
        }

        let mut recommendations = Vec::new();
        let status = if errors > CRITICAL_ERRORS || blocked_url_count > CRITICAL_BLOCKED_URLS {
            recommendations.push("High error rate detected. Consider pausing scraping.".to_string());
            recommendations.push("Review blocked URLs and error patterns.".to_string());
            SystemStatus::Critical
        } else if errors > DEGRADED_ERRORS
            || blocked_url_count > DEGRADED_BLOCKED_URLS
            || !suspended_sources.is_empty()
        {
            recommendations.push("Elevated error rate. Monitor closely.".to_string());
            recommendations.push("Consider reducing scraping rate.".to_string());
            SystemStatus::Degraded
        } else {
            SystemStatus::Healthy
        };

        if rate_limited > RATE_LIMIT_ADVICE_AT {
            recommendations.push("Many rate limit errors. Reduce request frequency.".to_string());
        }
        if blocked > BLOCKED_ADVICE_AT {
            recommendations
                .push("Bot walls are being hit. Lower request rates for the affected sources.".to_string());
        }
        for source in &suspended_sources {
            recommendations.push(format!("{source} is suspended after repeated bot-wall responses."));
        }

        SystemHealth {
            status,
            error_rate: if outcomes == 0 {
                0.0
            } else {
                errors as f64 / outcomes as f64
            },
            errors_in_window: errors,
            outcomes_in_window: outcomes,
            blocked_url_count,
            suspended_sources,
            recommendations,
        }
    }

    fn prune(&self, state: &mut SourceState, now: DateTime<Utc>) {
        let horizon = now - to_chrono(self.config.window);
        while state.outcomes.front().is_some_and(|(t, _)| *t <= horizon) {
            state.outcomes.pop_front();
        }
        state.blocked_urls.retain(|_, at| *at > horizon);
    }

    fn maybe_end_suspension(&self, source: Source, state: &mut SourceState, now: DateTime<Utc>) {
        if let Some(until) = state.suspended_until
            && now >= until
        {
            tracing::info!(%source, "Source suspension expired, resuming dispatch");
            state.suspended_until = None;
            state.consecutive_blocked = 0;
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
