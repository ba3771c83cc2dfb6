pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod job;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod rate_limit;
pub mod registry;
pub mod store;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use classify::{BackoffConfig, ErrorClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PipelineConfig, SourceConfig};
pub use error::{AdapterError, AppError, ErrorKind, ScrapeError};
pub use events::JobEvent;
pub use health::{HealthConfig, HealthMonitor, HealthStatus, SourceHealth, SystemHealth, SystemStatus};
pub use job::{JobKind, JobStatus, JobTarget, NewScrapeJob, Priority, ScrapeJob, SearchCriteria};
pub use models::{NormalizedProperty, RawListingRecord, SearchOutcome, Source};
pub use normalize::{NormalizeError, Normalizer, NormalizerConfig};
pub use orchestrator::{BatchHandle, Orchestrator, SourceStats};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::AdapterRegistry;
pub use store::MemoryStore;
pub use traits::{Fetcher, JobStore, PropertyStore, ScraperAdapter};
