use std::future::Future;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{AdapterError, AppError};
use crate::job::{ScrapeJob, SearchCriteria};
use crate::merge::AddressKey;
use crate::models::{NormalizedProperty, RawListingRecord, SearchOutcome, Source};

/// Fetches raw HTML content from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AdapterError>> + Send;
}

/// Fetch-and-parse contract for one listing site.
///
/// Implementations never leak site-specific shapes: everything they return
/// is a [`RawListingRecord`]. Object safe, so the orchestrator can hold a
/// registry of `Arc<dyn ScraperAdapter>`.
#[async_trait]
pub trait ScraperAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Scrape a single listing page.
    ///
    /// Fails with [`AdapterError::Parse`] when expected fields are missing and
    /// [`AdapterError::Blocked`] when the page is a bot wall.
    async fn scrape_listing_url(&self, url: &str) -> Result<RawListingRecord, AdapterError>;

    /// Run a criteria search. Cards that fail to parse are reported in
    /// [`SearchOutcome::errors`]; the call itself only fails when nothing
    /// usable came back.
    async fn search_listings(&self, criteria: &SearchCriteria)
    -> Result<SearchOutcome, AdapterError>;
}

/// Durable storage for canonical properties.
pub trait PropertyStore: Send + Sync + Clone {
    fn find_by_mls(
        &self,
        mls_number: &str,
    ) -> impl Future<Output = Result<Option<NormalizedProperty>, AppError>> + Send;

    fn find_by_address(
        &self,
        key: &AddressKey,
    ) -> impl Future<Output = Result<Option<NormalizedProperty>, AppError>> + Send;

    /// Insert or replace the property with `property.id`.
    fn upsert(
        &self,
        property: &NormalizedProperty,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<NormalizedProperty>, AppError>> + Send;

    /// Most recently scraped first.
    fn list(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<NormalizedProperty>, AppError>> + Send;
}

/// Durable record of job state transitions.
pub trait JobStore: Send + Sync + Clone {
    /// Insert or replace the job with `job.id`.
    fn save_job(&self, job: &ScrapeJob) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_job(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<ScrapeJob>, AppError>> + Send;

    /// Jobs that are `pending` or `processing`, oldest first.
    fn list_unfinished(&self) -> impl Future<Output = Result<Vec<ScrapeJob>, AppError>> + Send;
}
