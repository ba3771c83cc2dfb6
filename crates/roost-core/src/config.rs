use std::collections::BTreeMap;
use std::time::Duration;

use crate::classify::BackoffConfig;
use crate::error::AppError;
use crate::health::HealthConfig;
use crate::job::DEFAULT_MAX_ATTEMPTS;
use crate::models::Source;
use crate::normalize::NormalizerConfig;
use crate::rate_limit::RateLimitConfig;

/// Per-source knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub rate_limit: RateLimitConfig,
    /// Attempt budget for jobs that do not set their own.
    pub max_attempts: u32,
}

impl SourceConfig {
    pub fn for_source(source: Source) -> Self {
        Self {
            rate_limit: RateLimitConfig::for_source(source),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Everything the orchestrator needs to know up front.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sources: BTreeMap<Source, SourceConfig>,
    pub backoff: BackoffConfig,
    pub health: HealthConfig,
    pub normalizer: NormalizerConfig,
    /// Hard ceiling on a single adapter call.
    pub request_timeout: Duration,
    /// Longest a worker sleeps before re-checking its lane.
    pub poll_interval: Duration,
    /// Capacity of the job event broadcast channel.
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: Source::ALL
                .into_iter()
                .map(|s| (s, SourceConfig::for_source(s)))
                .collect(),
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
            normalizer: NormalizerConfig::default(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            event_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Read overrides from environment variables on top of the defaults.
    ///
    /// - `ROOST_REQUEST_TIMEOUT_SECS`
    /// - `ROOST_BACKOFF_BASE_SECS`, `ROOST_BACKOFF_CAP_SECS`
    /// - `ROOST_SUSPEND_COOLDOWN_SECS`, `ROOST_SUSPEND_THRESHOLD`
    /// - `ROOST_MAX_ATTEMPTS` (applies to every source)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(secs) = parse_positive(&lookup, "ROOST_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(&lookup, "ROOST_BACKOFF_BASE_SECS")? {
            config.backoff.base = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(&lookup, "ROOST_BACKOFF_CAP_SECS")? {
            config.backoff.cap = Duration::from_secs(secs);
        }
        if config.backoff.cap < config.backoff.base {
            return Err(AppError::ConfigError(format!(
                "backoff cap ({}s) is below backoff base ({}s)",
                config.backoff.cap.as_secs(),
                config.backoff.base.as_secs()
            )));
        }
        if let Some(secs) = parse_positive(&lookup, "ROOST_SUSPEND_COOLDOWN_SECS")? {
            config.health.suspend_cooldown = Duration::from_secs(secs);
            config.health.blocked_cooldown = Duration::from_secs(secs);
        }
        if let Some(n) = parse_positive(&lookup, "ROOST_SUSPEND_THRESHOLD")? {
            config.health.suspend_threshold = u32::try_from(n).map_err(|_| {
                AppError::ConfigError(format!("ROOST_SUSPEND_THRESHOLD '{n}' is too large"))
            })?;
        }
        if let Some(n) = parse_positive(&lookup, "ROOST_MAX_ATTEMPTS")? {
            let n = u32::try_from(n).map_err(|_| {
                AppError::ConfigError(format!("ROOST_MAX_ATTEMPTS '{n}' is too large"))
            })?;
            config = config.with_max_attempts(n);
        }

        Ok(config)
    }

    pub fn source(&self, source: Source) -> SourceConfig {
        self.sources
            .get(&source)
            .cloned()
            .unwrap_or_else(|| SourceConfig::for_source(source))
    }

    pub fn with_source(mut self, source: Source, config: SourceConfig) -> Self {
        self.sources.insert(source, config);
        self
    }

    pub fn with_rate_limit(mut self, source: Source, rate_limit: RateLimitConfig) -> Self {
        self.sources
            .entry(source)
            .or_insert_with(|| SourceConfig::for_source(source))
            .rate_limit = rate_limit;
        self
    }

    /// Attempt budget for every configured source.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        for source in self.sources.values_mut() {
            source.max_attempts = max_attempts.max(1);
        }
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, AppError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let parsed: u64 = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {key} '{raw}': must be a positive integer"))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(Some(parsed))
}
