//! Test utilities: mock implementations of the core traits and fixtures.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::AdapterError;
use crate::job::{DEFAULT_MAX_ATTEMPTS, NewScrapeJob, ScrapeJob, SearchCriteria};
use crate::models::{RawListingRecord, SearchOutcome, Source};
use crate::traits::{Fetcher, ScraperAdapter};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A listing that satisfies every normalization requirement.
///
/// Phoenix, AZ single-family home, 3 bd / 2 ba / 1800 sqft, for sale, no MLS
/// number, unit, images or HOA.
pub fn make_raw_listing(source: Source, address: &str, zip: &str, price: f64) -> RawListingRecord {
    let slug: String = address
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let url = match source {
        Source::Zillow => format!("https://www.zillow.com/homedetails/{slug}-{zip}/"),
        Source::Redfin => format!("https://www.redfin.com/AZ/Phoenix/{slug}-{zip}/home/1"),
        Source::HomesCom => format!("https://www.homes.com/property/{slug}-phoenix-az-{zip}/"),
    };

    let mut raw = RawListingRecord::new(source, url, Utc::now());
    raw.address_line = Some(address.to_string());
    raw.city = Some("Phoenix".into());
    raw.state = Some("AZ".into());
    raw.zip_code = Some(zip.to_string());
    raw.price = Some(price);
    raw.status_text = Some("For Sale".into());
    raw.property_type_text = Some("Single Family".into());
    raw.bedrooms = Some(3.0);
    raw.bathrooms = Some(2.0);
    raw.square_feet = Some(1800.0);
    raw
}

/// A pending job for `url` with the default attempt budget.
pub fn make_test_job(source: Source, url: &str) -> ScrapeJob {
    NewScrapeJob::url(source, url).into_job(Utc::now(), DEFAULT_MAX_ATTEMPTS, None)
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that returns scripted responses.
#[derive(Clone)]
pub struct MockFetcher {
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns a default HTML string.
    responses: Arc<Mutex<Vec<Result<String, AdapterError>>>>,
    requested: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self::with_responses(vec![Ok(html.to_string())])
    }

    pub fn with_error(error: AdapterError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AdapterError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requested: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// URLs fetched so far, in call order.
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AdapterError> {
        self.requested.lock().unwrap().push(url.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("<html><body>default</body></html>".to_string())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Mock scraper adapter with scripted results and call recording.
///
/// With an empty script, `scrape_listing_url` returns a valid listing at
/// "100 Main St, 85004" whose `source_url` is the requested URL, and
/// `search_listings` returns an empty outcome.
#[derive(Clone)]
pub struct MockAdapter {
    source: Source,
    listings: Arc<Mutex<Vec<Result<RawListingRecord, AdapterError>>>>,
    searches: Arc<Mutex<Vec<Result<SearchOutcome, AdapterError>>>>,
    calls: Arc<Mutex<Vec<(String, Instant)>>>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockAdapter {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            listings: Arc::new(Mutex::new(Vec::new())),
            searches: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_listing(&self, result: Result<RawListingRecord, AdapterError>) -> &Self {
        self.listings.lock().unwrap().push(result);
        self
    }

    pub fn push_search(&self, result: Result<SearchOutcome, AdapterError>) -> &Self {
        self.searches.lock().unwrap().push(result);
        self
    }

    /// Targets of every call so far, in call order. Searches are recorded
    /// by their job target display (`search:<place>`).
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, target: String) {
        self.calls.lock().unwrap().push((target, Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScraperAdapter for MockAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn scrape_listing_url(&self, url: &str) -> Result<RawListingRecord, AdapterError> {
        self.enter(url.to_string()).await;
        let scripted = {
            let mut listings = self.listings.lock().unwrap();
            (!listings.is_empty()).then(|| listings.remove(0))
        };
        self.exit();
        scripted.unwrap_or_else(|| {
            let mut raw = make_raw_listing(self.source, "100 Main St", "85004", 350_000.0);
            raw.source_url = url.to_string();
            Ok(raw)
        })
    }

    async fn search_listings(&self, criteria: &SearchCriteria) -> Result<SearchOutcome, AdapterError> {
        let target = crate::job::JobTarget::Search(criteria.clone()).to_string();
        self.enter(target).await;
        let scripted = {
            let mut searches = self.searches.lock().unwrap();
            (!searches.is_empty()).then(|| searches.remove(0))
        };
        self.exit();
        scripted.unwrap_or_else(|| Ok(SearchOutcome::default()))
    }
}
