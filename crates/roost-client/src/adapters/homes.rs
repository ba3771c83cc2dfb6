use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roost_core::error::AdapterError;
use roost_core::job::SearchCriteria;
use roost_core::models::{RawListingRecord, SearchOutcome, Source};
use roost_core::traits::{Fetcher, ScraperAdapter};
use scraper::Html;

use super::{CardLayout, city_slug, fetch_page, parse_base, parse_cards, require_core_fields};
use crate::parse::{
    absolute_url, all_texts, attr_values, extract_coordinates, first_text, labeled_values, lookup,
    parse_garage_spaces, parse_hoa, parse_lot_size, parse_number, parse_price, split_full_address,
};

pub const HOMES_BASE_URL: &str = "https://www.homes.com";

const STATE_SLUG: &str = "az";

const SEARCH_LAYOUT: CardLayout = CardLayout {
    card: ".placards-list .property-card",
    link: "a.property-card-link",
    price: &[".price-container"],
    address: &[".property-name", ".property-address"],
    beds: &[".detailed-info-container .beds"],
    baths: &[".detailed-info-container .baths"],
    sqft: &[".detailed-info-container .sqft"],
    kind: &[".property-type"],
    status: &[".property-card-flag"],
    count: &[".result-count"],
    no_results: &[".no-results-container", ".zero-state"],
};

/// Scrapes homes.com listing and search pages.
#[derive(Clone)]
pub struct HomesComAdapter<F> {
    fetcher: F,
    base_url: String,
}

impl<F: Fetcher> HomesComAdapter<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            base_url: HOMES_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `/phoenix-az/?price-min=300000&beds-min=3` style search URL.
    pub fn search_url(&self, criteria: &SearchCriteria) -> Result<String, AdapterError> {
        let zip = criteria.zip_code.as_deref().map(str::trim).filter(|z| !z.is_empty());
        let city = criteria.city.as_deref().map(str::trim).filter(|c| !c.is_empty());

        let place = match (zip, city) {
            (Some(zip), _) => zip.to_string(),
            (None, Some(city)) => city_slug(city),
            (None, None) => {
                return Err(AdapterError::InvalidData(
                    "search needs a city or zip code".to_string(),
                ));
            }
        };

        let mut url = parse_base(&self.base_url)?
            .join(&format!("{place}-{STATE_SLUG}/"))
            .map_err(|e| AdapterError::Other(format!("invalid search location '{place}': {e}")))?;

        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(min) = criteria.min_price {
            params.push(("price-min", min.to_string()));
        }
        if let Some(max) = criteria.max_price {
            params.push(("price-max", max.to_string()));
        }
        if let Some(beds) = criteria.min_beds {
            params.push(("beds-min", beds.to_string()));
        }
        if let Some(baths) = criteria.min_baths {
            params.push(("baths-min", baths.to_string()));
        }
        if let Some(sqft) = criteria.min_sqft {
            params.push(("sqft-min", sqft.to_string()));
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url.to_string())
    }
}

/// Parse a homes.com listing detail page.
pub fn parse_listing(
    html: &str,
    url: &str,
    scraped_at: DateTime<Utc>,
) -> Result<RawListingRecord, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let mut raw = RawListingRecord::new(Source::HomesCom, url, scraped_at);

    raw.source_listing_id = parse_base(url)?
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string));

    raw.price = first_text(root, &[".ldp-header-price .property-price", ".property-price"])?
        .and_then(|t| parse_price(&t));

    if let Some(address) = first_text(root, &[".ldp-header-address h1", ".property-info-address"])?
    {
        let parts = split_full_address(&address);
        raw.address_line = parts.street;
        raw.city = parts.city;
        raw.state = parts.state;
        raw.zip_code = parts.zip;
    }

    for item in all_texts(root, ".property-meta-item")? {
        let lower = item.to_lowercase();
        let value = parse_number(&item);
        if lower.contains("sq ft") || lower.contains("sqft") {
            raw.square_feet = value;
        } else if lower.contains("bed") {
            raw.bedrooms = value.map(|v| v as f32);
        } else if lower.contains("bath") {
            raw.bathrooms = value.map(|v| v as f32);
        }
    }

    raw.status_text = first_text(root, &[".property-status", ".ldp-status"])?;

    let info = labeled_values(root, ".property-info-item", ".label", ".value")?;
    raw.property_type_text = lookup(&info, "property type").map(str::to_string);
    raw.year_built = lookup(&info, "year built")
        .and_then(parse_number)
        .map(|y| y as i32);
    raw.lot_size = lookup(&info, "lot size").and_then(parse_lot_size);
    if let Some(hoa) = lookup(&info, "hoa") {
        (raw.has_hoa, raw.hoa_fee) = parse_hoa(hoa);
    }
    raw.garage_spaces = lookup(&info, "garage").and_then(parse_garage_spaces);
    raw.has_pool = lookup(&info, "pool").map(|v| {
        let lower = v.to_lowercase();
        lower.starts_with("yes") || (lower.contains("pool") && !lower.starts_with("no"))
    });
    raw.mls_number = lookup(&info, "mls").map(str::to_string);
    raw.days_on_market = lookup(&info, "days on market")
        .and_then(parse_number)
        .map(|d| d as i64);
    raw.county = lookup(&info, "county").map(str::to_string);

    let schools = labeled_values(root, ".schools-table tr", ".school-type", ".school-name")?;
    raw.elementary_school = lookup(&schools, "elementary").map(str::to_string);
    raw.middle_school = lookup(&schools, "middle").map(str::to_string);
    raw.high_school = lookup(&schools, "high").map(str::to_string);
    raw.school_district = first_text(root, &[".school-district-name"])?;

    if let Some((lat, lng)) = extract_coordinates(html) {
        raw.latitude = Some(lat);
        raw.longitude = Some(lng);
    }

    // Carousel images after the first are lazy-loaded through data-src.
    let base = parse_base(url)?;
    let mut images = attr_values(root, ".ldp-photo-carousel img", "src")?;
    images.extend(attr_values(root, ".ldp-photo-carousel img", "data-src")?);
    raw.image_urls = images
        .iter()
        .filter(|src| !src.starts_with("data:"))
        .filter_map(|src| absolute_url(&base, src))
        .collect();
    raw.primary_image_url = raw.image_urls.first().cloned();

    raw.raw = serde_json::json!({
        "property_info": info
            .iter()
            .map(|(label, value)| (label.clone(), serde_json::Value::String(value.clone())))
            .collect::<serde_json::Map<_, _>>(),
    });

    require_core_fields(&raw)?;
    Ok(raw)
}

/// Parse a homes.com search results page.
pub fn parse_search(
    html: &str,
    page_url: &str,
    criteria: &SearchCriteria,
    scraped_at: DateTime<Utc>,
) -> Result<SearchOutcome, AdapterError> {
    parse_cards(html, page_url, Source::HomesCom, &SEARCH_LAYOUT, criteria, scraped_at)
}

#[async_trait]
impl<F: Fetcher + 'static> ScraperAdapter for HomesComAdapter<F> {
    fn source(&self) -> Source {
        Source::HomesCom
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
            "Homes.com search parsed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::models::FeeFrequency;
    use roost_core::testutil::MockFetcher;

    const LISTING: &str = include_str!("../../fixtures/homes_listing.html");
    const SEARCH: &str = include_str!("../../fixtures/homes_search.html");
    const LISTING_URL: &str = "https://www.homes.com/property/2210-e-campbell-ave-phoenix-az/9k2mq4xv7yz3t/";

    #[test]
    fn parses_listing_page() {
        let raw = parse_listing(LISTING, LISTING_URL, Utc::now()).unwrap();

        assert_eq!(raw.source, Source::HomesCom);
        assert_eq!(raw.source_listing_id.as_deref(), Some("9k2mq4xv7yz3t"));
        assert_eq!(raw.price, Some(489_000.0));
        assert_eq!(raw.address_line.as_deref(), Some("2210 E Campbell Ave Unit 4"));
        assert_eq!(raw.city.as_deref(), Some("Phoenix"));
        assert_eq!(raw.zip_code.as_deref(), Some("85016"));
        assert_eq!(raw.bedrooms, Some(3.0));
        assert_eq!(raw.bathrooms, Some(2.5));
        assert_eq!(raw.square_feet, Some(1_705.0));
        assert_eq!(raw.status_text.as_deref(), Some("Pending"));
        assert_eq!(raw.property_type_text.as_deref(), Some("Townhouse"));
        assert_eq!(raw.year_built, Some(2006));
        assert_eq!(raw.has_hoa, Some(true));
        let fee = raw.hoa_fee.unwrap();
        assert_eq!(fee.amount, 540.0);
        assert_eq!(fee.frequency, Some(FeeFrequency::Quarterly));
        assert_eq!(raw.garage_spaces, Some(2));
        assert_eq!(raw.has_pool, Some(true));
        assert_eq!(raw.county.as_deref(), Some("Maricopa"));
        assert_eq!(raw.school_district.as_deref(), Some("Creighton Elementary District"));
        assert_eq!(raw.latitude, None);
        assert_eq!(
            raw.image_urls,
            vec![
                "https://images.homes.com/listings/102/1234567890-1.jpg".to_string(),
                "https://images.homes.com/listings/102/1234567890-2.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn parses_search_page() {
        let outcome = parse_search(
            SEARCH,
            "https://www.homes.com/85016-az/",
            &SearchCriteria::default(),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(outcome.total_found, 2);
        assert!(outcome.errors.is_empty());
        let first = &outcome.records[0];
        assert_eq!(
            first.source_url,
            "https://www.homes.com/property/2210-e-campbell-ave-phoenix-az/9k2mq4xv7yz3t/"
        );
        assert_eq!(first.price, Some(489_000.0));
        assert_eq!(first.bathrooms, Some(2.5));
        assert_eq!(first.property_type_text.as_deref(), Some("Townhouse"));
        assert_eq!(outcome.records[1].status_text.as_deref(), Some("Coming Soon"));
    }

    #[test]
    fn search_urls() {
        let adapter = HomesComAdapter::new(MockFetcher::new(""));
        let criteria = SearchCriteria {
            city: Some("Paradise Valley".into()),
            min_price: Some(1_000_000),
            min_baths: Some(2.5),
            ..Default::default()
        };
        assert_eq!(
            adapter.search_url(&criteria).unwrap(),
            "https://www.homes.com/paradise-valley-az/?price-min=1000000&baths-min=2.5"
        );

        let by_zip = SearchCriteria {
            zip_code: Some("85016".into()),
            ..Default::default()
        };
        assert_eq!(adapter.search_url(&by_zip).unwrap(), "https://www.homes.com/85016-az/");
    }

    #[tokio::test]
    async fn blank_body_is_blocked() {
        let adapter = HomesComAdapter::new(MockFetcher::new(""));
        let err = adapter.scrape_listing_url(LISTING_URL).await.unwrap_err();
        assert!(matches!(err, AdapterError::Blocked(_)));
    }

    #[tokio::test]
    async fn search_listings_uses_built_url() {
        let fetcher = MockFetcher::new(SEARCH);
        let adapter = HomesComAdapter::new(fetcher.clone());
        let criteria = SearchCriteria {
            zip_code: Some("85016".into()),
            min_beds: Some(3),
            ..Default::default()
        };

        let outcome = adapter.search_listings(&criteria).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(
            fetcher.requested(),
            vec!["https://www.homes.com/85016-az/?beds-min=3".to_string()]
        );
    }
}
