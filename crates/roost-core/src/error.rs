use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Source;

/// Infrastructure errors for Roost: storage, configuration, submission.
#[derive(Error, Debug)]
pub enum AppError {
    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A job names a source that has no registered adapter.
    #[error("No adapter registered for source '{0}'")]
    UnknownSource(Source),

    /// A submitted job is malformed.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Low-level failure reported by a fetcher or a scraper adapter.
///
/// Adapters know enough about the page to say "this is a CAPTCHA" or "the
/// price node is missing"; turning that into a retry decision is the
/// classifier's job, not theirs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("rate limited by remote site")]
    RateLimited { retry_after: Option<Duration> },

    #[error("blocked by bot detection: {0}")]
    Blocked(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid listing data: {0}")]
    InvalidData(String),

    #[error("{0}")]
    Other(String),
}

/// Failure taxonomy shared by the classifier, health monitor and job history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NetworkError,
    ParseError,
    RateLimit,
    Blocked,
    InvalidData,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::NetworkError,
        ErrorKind::ParseError,
        ErrorKind::RateLimit,
        ErrorKind::Blocked,
        ErrorKind::InvalidData,
        ErrorKind::Timeout,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Blocked => "BLOCKED",
            ErrorKind::InvalidData => "INVALID_DATA",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown error kind: {s}"))
    }
}

/// A classified scrape failure. This is the only failure shape the
/// orchestrator's state machine acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeError {
    pub kind: ErrorKind,
    pub message: String,
    pub source: Source,
    pub url: Option<String>,
    pub retryable: bool,
    pub retry_after: Option<DateTime<Utc>>,
}

impl fmt::Display for ScrapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.source, self.kind, self.message)
    }
}

impl std::error::Error for ScrapeError {}
