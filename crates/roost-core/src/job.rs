use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::{PropertyType, Source};

/// Default attempt budget for a job when neither the request nor the source
/// configuration overrides it.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Status of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    DeadLettered,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::DeadLettered => "dead_lettered",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::DeadLettered | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Dequeue priority. `High` always goes first within a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Sort rank: lower dequeues first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// Who asked for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Scheduled,
    OnDemand,
    UserTriggered,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scheduled => "scheduled",
            JobKind::OnDemand => "on-demand",
            JobKind::UserTriggered => "user-triggered",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobKind::Scheduled),
            "on-demand" => Ok(JobKind::OnDemand),
            "user-triggered" => Ok(JobKind::UserTriggered),
            _ => Err(format!("Unknown job kind: {s}")),
        }
    }
}

/// Structured search filters understood by every adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub city: Option<String>,
    pub zip_code: Option<String>,
    pub min_price: Option<u64>,
    pub max_price: Option<u64>,
    pub min_beds: Option<u32>,
    pub min_baths: Option<f32>,
    pub min_sqft: Option<u32>,
    pub property_type: Option<PropertyType>,
}

impl SearchCriteria {
    /// A search needs at least a location to be meaningful.
    pub fn has_location(&self) -> bool {
        self.city.as_deref().is_some_and(|c| !c.trim().is_empty())
            || self.zip_code.as_deref().is_some_and(|z| !z.trim().is_empty())
    }
}

/// What a job scrapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobTarget {
    Url(String),
    Search(SearchCriteria),
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTarget::Url(url) => f.write_str(url),
            JobTarget::Search(c) => {
                let place = c
                    .zip_code
                    .as_deref()
                    .or(c.city.as_deref())
                    .unwrap_or("anywhere");
                write!(f, "search:{place}")
            }
        }
    }
}

/// One failed attempt, as recorded on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
}

/// A unit of scraping work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub kind: JobKind,
    pub source: Source,
    pub target: JobTarget,
    pub owner_id: Option<String>,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<JobError>,
    pub properties_found: u32,
    pub properties_processed: u32,
    /// Per-listing problems of an otherwise successful search.
    pub partial_errors: Vec<String>,
}

impl ScrapeJob {
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn url(&self) -> Option<&str> {
        match &self.target {
            JobTarget::Url(url) => Some(url),
            JobTarget::Search(_) => None,
        }
    }

    /// Number of recorded failures of `kind`.
    pub fn failures_of(&self, kind: ErrorKind) -> usize {
        self.errors.iter().filter(|e| e.kind == kind).count()
    }
}

/// Request to create a new scrape job.
#[derive(Debug, Clone)]
pub struct NewScrapeJob {
    pub source: Source,
    pub target: JobTarget,
    pub kind: JobKind,
    pub priority: Priority,
    pub owner_id: Option<String>,
    pub max_attempts: Option<u32>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewScrapeJob {
    pub fn url(source: Source, url: impl Into<String>) -> Self {
        Self::new(source, JobTarget::Url(url.into()))
    }

    pub fn search(source: Source, criteria: SearchCriteria) -> Self {
        Self::new(source, JobTarget::Search(criteria))
    }

    fn new(source: Source, target: JobTarget) -> Self {
        Self {
            source,
            target,
            kind: JobKind::OnDemand,
            priority: Priority::Medium,
            owner_id: None,
            max_attempts: None,
            scheduled_for: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Check the request before it is accepted into a queue.
    pub fn validate(&self) -> Result<(), String> {
        match &self.target {
            JobTarget::Url(url) => {
                let parsed = url::Url::parse(url).map_err(|e| format!("invalid URL '{url}': {e}"))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(format!("URL scheme '{}' is not allowed", parsed.scheme()));
                }
            }
            JobTarget::Search(criteria) => {
                if !criteria.has_location() {
                    return Err("search criteria need a city or zip code".into());
                }
                if let (Some(min), Some(max)) = (criteria.min_price, criteria.max_price)
                    && min > max
                {
                    return Err(format!("min_price {min} exceeds max_price {max}"));
                }
            }
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".into());
        }
        Ok(())
    }

    /// Materialize the request into a pending job.
    pub fn into_job(
        self,
        now: DateTime<Utc>,
        default_max_attempts: u32,
        batch_id: Option<Uuid>,
    ) -> ScrapeJob {
        ScrapeJob {
            id: Uuid::new_v4(),
            batch_id,
            kind: self.kind,
            source: self.source,
            target: self.target,
            owner_id: self.owner_id,
            priority: self.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            created_at: now,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            started_at: None,
            completed_at: None,
            errors: Vec::new(),
            properties_found: 0,
            properties_processed: 0,
            partial_errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::DeadLettered,
            JobStatus::Cancelled,
        ] {
            let s = status.as_str();
            let parsed: JobStatus = s.parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_priority_rank_orders_high_first() {
        let mut priorities = vec![Priority::Low, Priority::High, Priority::Medium];
        priorities.sort_by_key(Priority::rank);
        assert_eq!(
            priorities,
            vec![Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn test_new_job_builder() {
        let now = Utc::now();
        let job = NewScrapeJob::url(Source::Zillow, "https://www.zillow.com/homedetails/1")
            .with_priority(Priority::High)
            .with_kind(JobKind::UserTriggered)
            .with_owner("user-7")
            .with_max_attempts(5)
            .into_job(now, DEFAULT_MAX_ATTEMPTS, None);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.owner_id.as_deref(), Some("user-7"));
        assert_eq!(job.scheduled_for, now);
        assert_eq!(job.url(), Some("https://www.zillow.com/homedetails/1"));
    }

    #[test]
    fn test_default_max_attempts_applies() {
        let job = NewScrapeJob::url(Source::Redfin, "https://www.redfin.com/x")
            .into_job(Utc::now(), 2, None);
        assert_eq!(job.max_attempts, 2);
        assert!(job.can_retry());
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        assert!(NewScrapeJob::url(Source::Zillow, "not a url").validate().is_err());
        assert!(NewScrapeJob::url(Source::Zillow, "ftp://zillow.com/x").validate().is_err());
        assert!(
            NewScrapeJob::search(Source::Zillow, SearchCriteria::default())
                .validate()
                .is_err()
        );

        let inverted = SearchCriteria {
            city: Some("Phoenix".into()),
            min_price: Some(500_000),
            max_price: Some(100_000),
            ..Default::default()
        };
        assert!(NewScrapeJob::search(Source::Zillow, inverted).validate().is_err());

        assert!(
            NewScrapeJob::url(Source::Zillow, "https://www.zillow.com/a")
                .with_max_attempts(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_target_display() {
        let search = JobTarget::Search(SearchCriteria {
            zip_code: Some("85004".into()),
            ..Default::default()
        });
        assert_eq!(search.to_string(), "search:85004");
    }
}
