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
    parse_garage_spaces, parse_hoa, parse_lot_size, parse_number, parse_price,
    split_city_state_zip,
};

pub const REDFIN_BASE_URL: &str = "https://www.redfin.com";

static HOME_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/home/(\d+)").expect("valid regex"));

/// Redfin addresses cities by internal id; zip codes work everywhere.
const CITY_PATHS: &[(&str, &str)] = &[
    ("phoenix", "14240/AZ/Phoenix"),
    ("scottsdale", "16657/AZ/Scottsdale"),
    ("mesa", "11857/AZ/Mesa"),
    ("chandler", "3833/AZ/Chandler"),
    ("tempe", "18409/AZ/Tempe"),
    ("gilbert", "6826/AZ/Gilbert"),
    ("glendale", "7001/AZ/Glendale"),
    ("paradise valley", "30916/AZ/Paradise-Valley"),
    ("peoria", "14372/AZ/Peoria"),
];

const SEARCH_LAYOUT: CardLayout = CardLayout {
    card: r#"[data-rf-test-name="mapHomeCard"]"#,
    link: "a[href]",
    price: &[".bp-Homecard__Price--value", ".homecardV2Price"],
    address: &[".bp-Homecard__Address", ".homeAddressV2"],
    beds: &[".bp-Homecard__Stats--beds"],
    baths: &[".bp-Homecard__Stats--baths"],
    sqft: &[".bp-Homecard__Stats--sqft"],
    kind: &[".bp-Homecard__PropertyType"],
    status: &[".bp-Homecard__Sash"],
    count: &[r#"[data-rf-test-id="homes-count"]"#, ".homes.summary"],
    no_results: &[".NoResults", r#"[data-rf-test-id="no-results"]"#],
};

/// Scrapes redfin.com listing and search pages.
#[derive(Clone)]
pub struct RedfinAdapter<F> {
    fetcher: F,
    base_url: String,
}

impl<F: Fetcher> RedfinAdapter<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            base_url: REDFIN_BASE_URL.to_string(),
        }
    }

    /// Point searches at another host (tests, mirrors).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `/zipcode/85004/filter/min-price=300000,min-beds=3` style search URL.
    ///
    /// Cities outside the known id table cannot be searched by name.
    pub fn search_url(&self, criteria: &SearchCriteria) -> Result<String, AdapterError> {
        let zip = criteria.zip_code.as_deref().map(str::trim).filter(|z| !z.is_empty());
        let city = criteria.city.as_deref().map(str::trim).filter(|c| !c.is_empty());

        let location = if let Some(zip) = zip {
            format!("zipcode/{zip}")
        } else if let Some(city) = city {
            let key = city.to_lowercase();
            let (_, path) = CITY_PATHS
                .iter()
                .find(|(name, _)| *name == key)
                .ok_or_else(|| {
                    AdapterError::InvalidData(format!("Redfin has no city mapping for '{city}'"))
                })?;
            format!("city/{path}")
        } else {
            return Err(AdapterError::InvalidData(
                "search needs a city or zip code".to_string(),
            ));
        };

        let mut filters = Vec::new();
        if let Some(min) = criteria.min_price {
            filters.push(format!("min-price={min}"));
        }
        if let Some(max) = criteria.max_price {
            filters.push(format!("max-price={max}"));
        }
        if let Some(beds) = criteria.min_beds {
            filters.push(format!("min-beds={beds}"));
        }
        if let Some(baths) = criteria.min_baths {
            filters.push(format!("min-baths={baths}"));
        }
        if let Some(sqft) = criteria.min_sqft {
            filters.push(format!("min-sqft={sqft}-sqft"));
        }

        let mut path = location;
        if !filters.is_empty() {
            path.push_str("/filter/");
            path.push_str(&filters.join(","));
        }
        let url = parse_base(&self.base_url)?
            .join(&path)
            .map_err(|e| AdapterError::Other(format!("invalid search path '{path}': {e}")))?;
        Ok(url.to_string())
    }
}

/// Parse a Redfin listing detail page.
pub fn parse_listing(
    html: &str,
    url: &str,
    scraped_at: DateTime<Utc>,
) -> Result<RawListingRecord, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let mut raw = RawListingRecord::new(Source::Redfin, url, scraped_at);

    raw.source_listing_id = HOME_ID_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    raw.price = first_text(
        root,
        &[
            r#"[data-rf-test-id="abp-price"] .statsValue"#,
            ".price-section .price",
        ],
    )?
    .and_then(|t| parse_price(&t));
    raw.address_line = first_text(
        root,
        &[r#"[data-rf-test-id="abp-streetLine"]"#, ".street-address"],
    )?
    .map(|s| s.trim_end_matches(',').to_string());
    if let Some(locality) = first_text(root, &[r#"[data-rf-test-id="abp-cityStateZip"]"#])? {
        let (city, state, zip) = split_city_state_zip(&locality);
        raw.city = city;
        raw.state = state;
        raw.zip_code = zip;
    }

    let stat = |id: &str| -> Result<Option<f64>, AdapterError> {
        let css = format!(r#"[data-rf-test-id="{id}"] .statsValue"#);
        Ok(first_text(root, &[css.as_str()])?.and_then(|t| parse_number(&t)))
    };
    raw.bedrooms = stat("abp-beds")?.map(|v| v as f32);
    raw.bathrooms = stat("abp-baths")?.map(|v| v as f32);
    raw.square_feet = stat("abp-sqFt")?;

    raw.status_text = first_text(
        root,
        &[r#"[data-rf-test-id="abp-status"]"#, ".ListingStatusBannerSection"],
    )?;

    let details = labeled_values(root, ".keyDetail", ".header", ".content")?;
    raw.property_type_text = lookup(&details, "style")
        .or_else(|| lookup(&details, "property type"))
        .map(str::to_string);
    raw.year_built = lookup(&details, "year built")
        .and_then(parse_number)
        .map(|y| y as i32);
    raw.lot_size = lookup(&details, "lot size").and_then(parse_lot_size);
    if let Some(hoa) = lookup(&details, "hoa") {
        (raw.has_hoa, raw.hoa_fee) = parse_hoa(hoa);
    }
    raw.mls_number = lookup(&details, "mls").map(str::to_string);
    raw.days_on_market = lookup(&details, "on redfin")
        .and_then(parse_number)
        .map(|d| d as i64);
    raw.county = lookup(&details, "county").map(str::to_string);

    let amenities = all_texts(root, ".amenity-group li")?;
    raw.garage_spaces = amenities
        .iter()
        .filter(|a| a.to_lowercase().contains("garage"))
        .find_map(|a| parse_garage_spaces(a));
    if !amenities.is_empty() {
        raw.has_pool = Some(amenities.iter().any(|a| {
            let lower = a.to_lowercase();
            lower.contains("pool") && !lower.contains("no pool")
        }));
    }

    let schools = labeled_values(root, ".school-card", ".grades", ".school-name")?;
    raw.elementary_school = lookup(&schools, "elementary").map(str::to_string);
    raw.middle_school = lookup(&schools, "middle").map(str::to_string);
    raw.high_school = lookup(&schools, "high").map(str::to_string);
    raw.school_district = first_text(root, &[".school-district"])?;

    if let Some((lat, lng)) = extract_coordinates(html) {
        raw.latitude = Some(lat);
        raw.longitude = Some(lng);
    }

    let base = parse_base(url)?;
    raw.image_urls = attr_values(root, ".InlinePhotoPreview img, .PhotoThumbnail img", "src")?
        .iter()
        .filter(|src| !src.contains("placeholder"))
        .filter_map(|src| absolute_url(&base, src))
        .collect();
    raw.primary_image_url = raw.image_urls.first().cloned();

    raw.raw = serde_json::json!({
        "key_details": details
            .iter()
            .map(|(label, value)| (label.clone(), serde_json::Value::String(value.clone())))
            .collect::<serde_json::Map<_, _>>(),
    });

    require_core_fields(&raw)?;
    Ok(raw)
}

/// Parse a Redfin search results page.
pub fn parse_search(
    html: &str,
    page_url: &str,
    criteria: &SearchCriteria,
    scraped_at: DateTime<Utc>,
) -> Result<SearchOutcome, AdapterError> {
    parse_cards(html, page_url, Source::Redfin, &SEARCH_LAYOUT, criteria, scraped_at)
}

#[async_trait]
impl<F: Fetcher + 'static> ScraperAdapter for RedfinAdapter<F> {
    fn source(&self) -> Source {
        Source::Redfin
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
            "Redfin search parsed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::models::{FeeFrequency, LotUnit};
    use roost_core::testutil::MockFetcher;

    const LISTING: &str = include_str!("../../fixtures/redfin_listing.html");
    const SEARCH: &str = include_str!("../../fixtures/redfin_search.html");
    const LISTING_URL: &str = "https://www.redfin.com/AZ/Phoenix/4521-E-Camelback-Rd-85018/home/28012345";

    #[test]
    fn parses_listing_page() {
        let raw = parse_listing(LISTING, LISTING_URL, Utc::now()).unwrap();

        assert_eq!(raw.source, Source::Redfin);
        assert_eq!(raw.source_listing_id.as_deref(), Some("28012345"));
        assert_eq!(raw.price, Some(625_000.0));
        assert_eq!(raw.address_line.as_deref(), Some("4521 E Camelback Rd"));
        assert_eq!(raw.city.as_deref(), Some("Phoenix"));
        assert_eq!(raw.state.as_deref(), Some("AZ"));
        assert_eq!(raw.zip_code.as_deref(), Some("85018"));
        assert_eq!(raw.bedrooms, Some(4.0));
        assert_eq!(raw.bathrooms, Some(2.5));
        assert_eq!(raw.square_feet, Some(2_340.0));
        assert_eq!(raw.status_text.as_deref(), Some("Active"));
        assert_eq!(raw.property_type_text.as_deref(), Some("Single Family Residential"));
        assert_eq!(raw.year_built, Some(1998));
        assert_eq!(raw.lot_size.map(|l| l.unit), Some(LotUnit::SqFt));
        assert_eq!(raw.has_hoa, Some(true));
        assert_eq!(raw.hoa_fee.unwrap().frequency, Some(FeeFrequency::Monthly));
        assert_eq!(raw.mls_number.as_deref(), Some("6712345"));
        assert_eq!(raw.days_on_market, Some(12));
        assert_eq!(raw.garage_spaces, Some(2));
        assert_eq!(raw.has_pool, Some(true));
        assert_eq!(raw.elementary_school.as_deref(), Some("Madison Simis Elementary School"));
        assert_eq!(raw.high_school.as_deref(), Some("Camelback High School"));
        assert_eq!(raw.latitude, Some(33.5092));
        assert_eq!(raw.longitude, Some(-111.9823));
        assert_eq!(raw.image_urls.len(), 2);
        assert_eq!(raw.primary_image_url, raw.image_urls.first().cloned());
        assert_eq!(raw.raw["key_details"]["MLS#"], "6712345");
    }

    #[test]
    fn listing_without_price_is_a_parse_error() {
        let html = r#"<div data-rf-test-id="abp-streetLine">1 Main St</div>"#;
        let err = parse_listing(html, LISTING_URL, Utc::now()).unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }

    #[test]
    fn parses_search_cards_and_reports_bad_ones() {
        let criteria = SearchCriteria {
            zip_code: Some("85018".into()),
            ..Default::default()
        };
        let outcome = parse_search(
            SEARCH,
            "https://www.redfin.com/zipcode/85018",
            &criteria,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(outcome.total_found, 3);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("card 3: unreadable price"));

        let first = &outcome.records[0];
        assert_eq!(
            first.source_url,
            "https://www.redfin.com/AZ/Phoenix/4521-E-Camelback-Rd-85018/home/28012345"
        );
        assert_eq!(first.price, Some(625_000.0));
        assert_eq!(first.address_line.as_deref(), Some("4521 E Camelback Rd"));
        assert_eq!(first.zip_code.as_deref(), Some("85018"));
        assert_eq!(first.bedrooms, Some(4.0));
        assert_eq!(outcome.records[1].price, Some(1_150_000.0));
    }

    #[test]
    fn empty_search_needs_an_explicit_no_results_marker() {
        let criteria = SearchCriteria::default();
        let url = "https://www.redfin.com/zipcode/85018";

        let none = r#"<div class="NoResults">No results found</div>"#;
        let outcome = parse_search(none, url, &criteria, Utc::now()).unwrap();
        assert!(outcome.records.is_empty());

        let err = parse_search("<html><body></body></html>", url, &criteria, Utc::now()).unwrap_err();
        assert!(matches!(err, AdapterError::Blocked(_)));
    }

    #[test]
    fn search_urls() {
        let adapter = RedfinAdapter::new(MockFetcher::new(""));
        let by_zip = SearchCriteria {
            zip_code: Some("85018".into()),
            min_price: Some(300_000),
            max_price: Some(700_000),
            min_beds: Some(3),
            ..Default::default()
        };
        assert_eq!(
            adapter.search_url(&by_zip).unwrap(),
            "https://www.redfin.com/zipcode/85018/filter/min-price=300000,max-price=700000,min-beds=3"
        );

        let by_city = SearchCriteria {
            city: Some("Paradise Valley".into()),
            ..Default::default()
        };
        assert_eq!(
            adapter.search_url(&by_city).unwrap(),
            "https://www.redfin.com/city/30916/AZ/Paradise-Valley"
        );

        let unknown = SearchCriteria {
            city: Some("Flagstaff".into()),
            ..Default::default()
        };
        assert!(matches!(
            adapter.search_url(&unknown),
            Err(AdapterError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn scrape_listing_url_fetches_and_parses() {
        let fetcher = MockFetcher::new(LISTING);
        let adapter = RedfinAdapter::new(fetcher.clone());

        let raw = adapter.scrape_listing_url(LISTING_URL).await.unwrap();
        assert_eq!(raw.mls_number.as_deref(), Some("6712345"));
        assert_eq!(fetcher.requested(), vec![LISTING_URL.to_string()]);
    }

    #[tokio::test]
    async fn fetch_errors_pass_through() {
        let adapter = RedfinAdapter::new(MockFetcher::with_error(AdapterError::RateLimited {
            retry_after: None,
        }));
        let err = adapter.scrape_listing_url(LISTING_URL).await.unwrap_err();
        assert!(matches!(err, AdapterError::RateLimited { .. }));
    }
}
