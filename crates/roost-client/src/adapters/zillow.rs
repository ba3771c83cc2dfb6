use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use roost_core::error::AdapterError;
use roost_core::job::SearchCriteria;
use roost_core::models::{RawListingRecord, SearchOutcome, Source};
use roost_core::traits::{Fetcher, ScraperAdapter};
use scraper::Html;

use super::{CardLayout, fetch_page, parse_base, parse_cards, require_core_fields};
use crate::parse::{
    absolute_url, all_texts, attr_values, extract_coordinates, first_text, labeled_values, lookup,
    parse_garage_spaces, parse_hoa, parse_lot_size, parse_number, parse_price, split_full_address,
};

pub const ZILLOW_BASE_URL: &str = "https://www.zillow.com";

/// State appended to city searches; the pipeline targets Arizona markets.
const DEFAULT_STATE: &str = "AZ";

static ZPID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d+)_zpid").expect("valid regex"));

const SEARCH_LAYOUT: CardLayout = CardLayout {
    card: r#"[data-test="property-card"]"#,
    link: r#"a[data-test="property-card-link"]"#,
    price: &[r#"[data-test="property-card-price"]"#],
    address: &[r#"[data-test="property-card-addr"]"#, "address"],
    beds: &[r#"[data-test="property-card-details"] li:nth-child(1)"#],
    baths: &[r#"[data-test="property-card-details"] li:nth-child(2)"#],
    sqft: &[r#"[data-test="property-card-details"] li:nth-child(3)"#],
    kind: &[r#"[data-test="property-card-type"]"#],
    status: &[r#"[data-test="property-card-status"]"#],
    count: &[".result-count"],
    no_results: &[r#"[data-test="zero-results"]"#, ".zero-results-message"],
};

/// Scrapes zillow.com listing and search pages.
#[derive(Clone)]
pub struct ZillowAdapter<F> {
    fetcher: F,
    base_url: String,
}

impl<F: Fetcher> ZillowAdapter<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            base_url: ZILLOW_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `/homes/85004_rb/300000-600000_price/3-_beds/` style search URL.
    pub fn search_url(&self, criteria: &SearchCriteria) -> Result<String, AdapterError> {
        let zip = criteria.zip_code.as_deref().map(str::trim).filter(|z| !z.is_empty());
        let city = criteria.city.as_deref().map(str::trim).filter(|c| !c.is_empty());

        let mut path = match (zip, city) {
            (Some(zip), _) => format!("homes/{zip}_rb/"),
            (None, Some(city)) => {
                let name = city.split_whitespace().collect::<Vec<_>>().join("-");
                format!("homes/{name}-{DEFAULT_STATE}_rb/")
            }
            (None, None) => {
                return Err(AdapterError::InvalidData(
                    "search needs a city or zip code".to_string(),
                ));
            }
        };

        if criteria.min_price.is_some() || criteria.max_price.is_some() {
            let min = criteria.min_price.map(|p| p.to_string()).unwrap_or_default();
            let max = criteria.max_price.map(|p| p.to_string()).unwrap_or_default();
            path.push_str(&format!("{min}-{max}_price/"));
        }
        if let Some(beds) = criteria.min_beds {
            path.push_str(&format!("{beds}-_beds/"));
        }
        if let Some(baths) = criteria.min_baths {
            path.push_str(&format!("{baths}-_baths/"));
        }
        if let Some(sqft) = criteria.min_sqft {
            path.push_str(&format!("{sqft}-_size/"));
        }

        let url = parse_base(&self.base_url)?
            .join(&path)
            .map_err(|e| AdapterError::Other(format!("invalid search path '{path}': {e}")))?;
        Ok(url.to_string())
    }
}

/// Parse a Zillow home details page.
pub fn parse_listing(
    html: &str,
    url: &str,
    scraped_at: DateTime<Utc>,
) -> Result<RawListingRecord, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let mut raw = RawListingRecord::new(Source::Zillow, url, scraped_at);

    raw.source_listing_id = ZPID_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    raw.price = first_text(
        root,
        &[
            r#"[data-test="home-details-summary"] span[data-test="property-price"]"#,
            r#"span[data-testid="price"]"#,
        ],
    )?
    .and_then(|t| parse_price(&t));

    if let Some(address) = first_text(root, &[r#"[data-test="home-details-summary"] h1"#, "h1"])? {
        let parts = split_full_address(&address);
        raw.address_line = parts.street;
        raw.city = parts.city;
        raw.state = parts.state;
        raw.zip_code = parts.zip;
    }

    // "3 bd", "2 ba", "1,800 sqft" in one strip.
    for fact in all_texts(root, r#"[data-test="bed-bath-sqft-fact"]"#)? {
        let lower = fact.to_lowercase();
        let value = parse_number(&fact);
        if lower.contains("sqft") || lower.contains("sq ft") {
            raw.square_feet = value;
        } else if lower.contains("bd") || lower.contains("bed") {
            raw.bedrooms = value.map(|v| v as f32);
        } else if lower.contains("ba") {
            raw.bathrooms = value.map(|v| v as f32);
        }
    }

    raw.status_text = first_text(root, &[r#"[data-test="home-status"]"#])?;
    raw.property_type_text = first_text(root, &[r#"[data-test="home-type"]"#])?;
    raw.year_built = first_text(root, &[r#"[data-test="year-built"]"#])?
        .and_then(|t| parse_number(&t))
        .map(|y| y as i32);

    let facts = labeled_values(root, ".fact-container", ".fact-label", ".fact-value")?;
    if raw.property_type_text.is_none() {
        raw.property_type_text = lookup(&facts, "type").map(str::to_string);
    }
    raw.lot_size = lookup(&facts, "lot").and_then(parse_lot_size);
    if let Some(hoa) = lookup(&facts, "hoa") {
        (raw.has_hoa, raw.hoa_fee) = parse_hoa(hoa);
    }
    raw.garage_spaces = lookup(&facts, "parking")
        .or_else(|| lookup(&facts, "garage"))
        .and_then(parse_garage_spaces);
    raw.has_pool = lookup(&facts, "pool").map(|v| {
        let lower = v.to_lowercase();
        !(lower.starts_with("no") || lower == "none")
    });
    raw.mls_number = lookup(&facts, "mls").map(str::to_string);
    raw.days_on_market = lookup(&facts, "on zillow")
        .and_then(parse_number)
        .map(|d| d as i64);
    raw.county = lookup(&facts, "county").map(str::to_string);

    let schools = labeled_values(
        root,
        r#"[data-test="school-row"]"#,
        ".school-level",
        ".school-name",
    )?;
    raw.elementary_school = lookup(&schools, "elementary").map(str::to_string);
    raw.middle_school = lookup(&schools, "middle").map(str::to_string);
    raw.high_school = lookup(&schools, "high").map(str::to_string);

    if let Some((lat, lng)) = extract_coordinates(html) {
        raw.latitude = Some(lat);
        raw.longitude = Some(lng);
    }

    let base = parse_base(url)?;
    raw.image_urls = attr_values(root, r#"[data-test="photo-carousel"] img"#, "src")?
        .iter()
        .filter_map(|src| absolute_url(&base, src))
        .collect();
    raw.primary_image_url = raw.image_urls.first().cloned();

    raw.raw = serde_json::json!({
        "facts": facts
            .iter()
            .map(|(label, value)| (label.clone(), serde_json::Value::String(value.clone())))
            .collect::<serde_json::Map<_, _>>(),
    });

    require_core_fields(&raw)?;
    Ok(raw)
}

/// Parse a Zillow search results page.
pub fn parse_search(
    html: &str,
    page_url: &str,
    criteria: &SearchCriteria,
    scraped_at: DateTime<Utc>,
) -> Result<SearchOutcome, AdapterError> {
    parse_cards(html, page_url, Source::Zillow, &SEARCH_LAYOUT, criteria, scraped_at)
}

#[async_trait]
impl<F: Fetcher + 'static> ScraperAdapter for ZillowAdapter<F> {
    fn source(&self) -> Source {
        Source::Zillow
    }

    async fn scrape_listing_url(&self, url: &str) -> Result<RawListingRecord, AdapterError> {
        let html = fetch_page(&self.fetcher, url).await?;
        parse_listing(&html, url, Utc::now())
    }

    async fn search_listings(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<SearchOutcome, AdapterError> {
        let url = self.search_url(criteria)?;
        let html = fetch_page(&self.fetcher, &url).await?;
        let outcome = parse_search(&html, &url, criteria, Utc::now())?;
        tracing::debug!(
            %url,
            found = outcome.total_found,
            parsed = outcome.records.len(),
            "Zillow search parsed"
        );
        Ok(outcome)
    }
}
