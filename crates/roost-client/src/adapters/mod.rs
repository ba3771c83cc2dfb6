//! One [`ScraperAdapter`] per listing site.
//!
//! Each adapter owns its URL scheme and selectors. Page parsing is done by
//! plain synchronous functions so it can be tested against fixture HTML
//! without a network, and so no `scraper::Html` is ever held across an
//! `.await`.

pub mod homes;
pub mod redfin;
pub mod zillow;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use roost_core::error::AdapterError;
use roost_core::job::SearchCriteria;
use roost_core::models::{RawListingRecord, SearchOutcome, Source};
use roost_core::registry::AdapterRegistry;
use roost_core::traits::{Fetcher, ScraperAdapter};
use scraper::{ElementRef, Html};
use url::Url;

use crate::parse::{
    absolute_url, attr_values, detect_bot_wall, element_text, first_text, parse_number,
    parse_price, selector, split_full_address,
};

pub use homes::HomesComAdapter;
pub use redfin::RedfinAdapter;
pub use zillow::ZillowAdapter;

/// Registry with an adapter for every supported site, all sharing `fetcher`.
pub fn default_registry<F: Fetcher + 'static>(fetcher: F) -> AdapterRegistry {
    AdapterRegistry::new()
        .with(Arc::new(ZillowAdapter::new(fetcher.clone())))
        .with(Arc::new(RedfinAdapter::new(fetcher.clone())))
        .with(Arc::new(HomesComAdapter::new(fetcher)))
}

/// Fetch `url` and reject bodies that cannot be listing content.
pub(crate) async fn fetch_page<F: Fetcher>(fetcher: &F, url: &str) -> Result<String, AdapterError> {
    let html = fetcher.fetch(url).await?;
    if html.trim().is_empty() {
        return Err(AdapterError::Blocked(format!("empty response from {url}")));
    }
    if let Some(marker) = detect_bot_wall(&html) {
        tracing::warn!(%url, marker, "Bot wall detected");
        return Err(AdapterError::Blocked(format!(
            "bot-detection page at {url} ({marker})"
        )));
    }
    Ok(html)
}

pub(crate) fn parse_base(base_url: &str) -> Result<Url, AdapterError> {
    Url::parse(base_url).map_err(|e| AdapterError::Other(format!("invalid base URL '{base_url}': {e}")))
}

/// Slug form of a city name: `"Paradise Valley"` → `"paradise-valley"`.
pub(crate) fn city_slug(city: &str) -> String {
    city.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Listing pages without a price or street address are not worth keeping.
pub(crate) fn require_core_fields(raw: &RawListingRecord) -> Result<(), AdapterError> {
    if raw.price.is_none() {
        return Err(AdapterError::Parse(format!(
            "no price found on {}",
            raw.source_url
        )));
    }
    if raw.address_line.is_none() {
        return Err(AdapterError::Parse(format!(
            "no address found on {}",
            raw.source_url
        )));
    }
    Ok(())
}

/// Selectors describing one site's search result cards.
pub(crate) struct CardLayout {
    pub card: &'static str,
    pub link: &'static str,
    pub price: &'static [&'static str],
    pub address: &'static [&'static str],
    pub beds: &'static [&'static str],
    pub baths: &'static [&'static str],
    pub sqft: &'static [&'static str],
    pub kind: &'static [&'static str],
    pub status: &'static [&'static str],
    /// Header text carrying the site's own result count (`"42 homes"`).
    pub count: &'static [&'static str],
    /// Present when the site explicitly reports zero matches.
    pub no_results: &'static [&'static str],
}

/// Turn a search results page into records, one per card.
///
/// A page with no cards is only accepted when the site says so; otherwise
/// it is treated as a block page in disguise.
pub(crate) fn parse_cards(
    html: &str,
    page_url: &str,
    source: Source,
    layout: &CardLayout,
    criteria: &SearchCriteria,
    scraped_at: DateTime<Utc>,
) -> Result<SearchOutcome, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let card_sel = selector(layout.card)?;
    let cards: Vec<ElementRef<'_>> = root.select(&card_sel).collect();

    if cards.is_empty() {
        if first_text(root, layout.no_results)?.is_some() {
            return Ok(SearchOutcome::default());
        }
        return Err(AdapterError::Blocked(format!(
            "search page {page_url} has no result cards"
        )));
    }

    let base = parse_base(page_url)?;
    let advertised = first_text(root, layout.count)?
        .and_then(|t| parse_number(&t))
        .map(|n| n as usize);
    let mut outcome = SearchOutcome {
        total_found: advertised.unwrap_or(cards.len()).max(cards.len()),
        ..Default::default()
    };

    for (index, card) in cards.into_iter().enumerate() {
        match parse_card(card, &base, source, layout, criteria, scraped_at) {
            Ok(raw) => outcome.records.push(raw),
            Err(reason) => outcome.errors.push(format!("card {}: {reason}", index + 1)),
        }
    }

    if outcome.records.is_empty() {
        return Err(AdapterError::Parse(format!(
            "none of the result cards on {page_url} could be read: {}",
            outcome.errors.join("; ")
        )));
    }
    Ok(outcome)
}

fn parse_card(
    card: ElementRef<'_>,
    base: &Url,
    source: Source,
    layout: &CardLayout,
    criteria: &SearchCriteria,
    scraped_at: DateTime<Utc>,
) -> Result<RawListingRecord, String> {
    let link = selector(layout.link).map_err(|e| e.to_string())?;
    let href = card
        .select(&link)
        .find_map(|a| a.value().attr("href"))
        .ok_or("missing listing link")?;
    let url = absolute_url(base, href).ok_or_else(|| format!("unusable link '{href}'"))?;

    let text = |selectors: &[&str]| first_text(card, selectors).map_err(|e| e.to_string());

    let mut raw = RawListingRecord::new(source, url, scraped_at);
    let price = text(layout.price)?.ok_or("missing price")?;
    raw.price = Some(parse_price(&price).ok_or_else(|| format!("unreadable price '{price}'"))?);

    let address = text(layout.address)?.ok_or("missing address")?;
    let parts = split_full_address(&address);
    raw.address_line = parts.street;
    raw.city = parts.city;
    raw.state = parts.state;
    raw.zip_code = parts.zip;

    raw.bedrooms = text(layout.beds)?.and_then(|t| parse_number(&t)).map(|v| v as f32);
    raw.bathrooms = text(layout.baths)?.and_then(|t| parse_number(&t)).map(|v| v as f32);
    raw.square_feet = text(layout.sqft)?.and_then(|t| parse_number(&t));
    raw.property_type_text = text(layout.kind)?
        .or_else(|| criteria.property_type.map(|kind| kind.to_string()));
    raw.status_text = text(layout.status)?;

    let images = attr_values(card, "img", "src").map_err(|e| e.to_string())?;
    raw.primary_image_url = images
        .iter()
        .find_map(|src| absolute_url(base, src));
    raw.raw = serde_json::json!({ "card": element_text(card) });
    Ok(raw)
}
