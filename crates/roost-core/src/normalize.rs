//! Harmonization of adapter output into [`NormalizedProperty`].
//!
//! The normalizer is pure: the same [`RawListingRecord`] always yields the
//! same property (apart from the freshly generated id). Addresses are
//! canonicalized so that two sites describing the same house produce the
//! same [`crate::merge::AddressKey`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use chrono::Datelike;
use regex::{Captures, Regex};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::{
    Address, GeoPoint, LotSize, LotUnit, ListingStatus, NormalizedProperty, PropertyType,
    RawListingRecord, Schools, FeeFrequency,
};

const SQFT_PER_ACRE: f64 = 43_560.0;

/// Longest MLS number kept; matches the `properties.mls_number` column.
pub const MAX_MLS_LEN: usize = 32;

/// Lot sizes below this with no published unit are taken to be acres.
const ACRES_THRESHOLD: f64 = 500.0;

static UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\s,]+(?:(?:apt|apartment|unit|ste|suite|bldg)\b\.?\s*#?|#)\s*([a-z0-9-]+)$")
        .expect("valid regex")
});
static MLS_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(MLS|ARMLS|AZ)[#:\s]*").expect("valid regex"));
static ZIP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{5}").expect("valid regex"));
static LOT_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blots?\b").expect("valid regex"));
static SCHOOL_LEVEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(elementary|middle|high) school\b").expect("valid regex")
});

const STREET_SUFFIXES: &[(&str, &str)] = &[
    ("street", "St"),
    ("st", "St"),
    ("avenue", "Ave"),
    ("ave", "Ave"),
    ("av", "Ave"),
    ("road", "Rd"),
    ("rd", "Rd"),
    ("drive", "Dr"),
    ("dr", "Dr"),
    ("lane", "Ln"),
    ("ln", "Ln"),
    ("boulevard", "Blvd"),
    ("blvd", "Blvd"),
    ("court", "Ct"),
    ("ct", "Ct"),
    ("place", "Pl"),
    ("pl", "Pl"),
    ("way", "Way"),
    ("circle", "Cir"),
    ("cir", "Cir"),
    ("parkway", "Pkwy"),
    ("pkwy", "Pkwy"),
    ("terrace", "Ter"),
    ("ter", "Ter"),
    ("trail", "Trl"),
    ("trl", "Trl"),
    ("highway", "Hwy"),
    ("hwy", "Hwy"),
];

const DIRECTIONALS: &[(&str, &str)] = &[
    ("north", "N"),
    ("n", "N"),
    ("south", "S"),
    ("s", "S"),
    ("east", "E"),
    ("e", "E"),
    ("west", "W"),
    ("w", "W"),
    ("northeast", "NE"),
    ("ne", "NE"),
    ("northwest", "NW"),
    ("nw", "NW"),
    ("southeast", "SE"),
    ("se", "SE"),
    ("southwest", "SW"),
    ("sw", "SW"),
];

const STATES: &[(&str, &str)] = &[
    ("alabama", "AL"),
    ("alaska", "AK"),
    ("arizona", "AZ"),
    ("arkansas", "AR"),
    ("california", "CA"),
    ("colorado", "CO"),
    ("connecticut", "CT"),
    ("delaware", "DE"),
    ("district of columbia", "DC"),
    ("florida", "FL"),
    ("georgia", "GA"),
    ("hawaii", "HI"),
    ("idaho", "ID"),
    ("illinois", "IL"),
    ("indiana", "IN"),
    ("iowa", "IA"),
    ("kansas", "KS"),
    ("kentucky", "KY"),
    ("louisiana", "LA"),
    ("maine", "ME"),
    ("maryland", "MD"),
    ("massachusetts", "MA"),
    ("michigan", "MI"),
    ("minnesota", "MN"),
    ("mississippi", "MS"),
    ("missouri", "MO"),
    ("montana", "MT"),
    ("nebraska", "NE"),
    ("nevada", "NV"),
    ("new hampshire", "NH"),
    ("new jersey", "NJ"),
    ("new mexico", "NM"),
    ("new york", "NY"),
    ("north carolina", "NC"),
    ("north dakota", "ND"),
    ("ohio", "OH"),
    ("oklahoma", "OK"),
    ("oregon", "OR"),
    ("pennsylvania", "PA"),
    ("rhode island", "RI"),
    ("south carolina", "SC"),
    ("south dakota", "SD"),
    ("tennessee", "TN"),
    ("texas", "TX"),
    ("utah", "UT"),
    ("vermont", "VT"),
    ("virginia", "VA"),
    ("washington", "WA"),
    ("west virginia", "WV"),
    ("wisconsin", "WI"),
    ("wyoming", "WY"),
];

fn lookup(table: &[(&str, &'static str)], word: &str) -> Option<&'static str> {
    let lower = word.to_lowercase();
    table.iter().find(|(k, _)| *k == lower).map(|(_, v)| *v)
}

/// Why a record could not become a property.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl NormalizeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidData
    }
}

/// Bounds applied while normalizing.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizerConfig {
    pub min_price: f64,
    pub max_price: f64,
    pub min_year_built: i32,
    /// Years past the scrape year a build year may lie (new construction).
    pub future_year_slack: i32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_price: 10_000.0,
            max_price: 100_000_000.0,
            min_year_built: 1800,
            future_year_slack: 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalize one raw record.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError`] when a hard requirement (street, city, zip,
    /// price, property type) is missing or out of range.
    pub fn normalize(&self, raw: &RawListingRecord) -> Result<NormalizedProperty, NormalizeError> {
        let line = non_empty(raw.address_line.as_deref())
            .ok_or(NormalizeError::MissingField("address"))?;
        let (street, embedded_unit) = normalize_street(line);
        if street.is_empty() {
            return Err(NormalizeError::MissingField("address"));
        }
        let unit = non_empty(raw.unit.as_deref())
            .map(normalize_unit)
            .or(embedded_unit);

        let city = non_empty(raw.city.as_deref())
            .map(title_case)
            .ok_or(NormalizeError::MissingField("city"))?;

        let zip_text = non_empty(raw.zip_code.as_deref())
            .ok_or(NormalizeError::MissingField("zip_code"))?;
        let zip = normalize_zip(zip_text).ok_or_else(|| NormalizeError::InvalidField {
            field: "zip_code",
            reason: format!("no 5-digit code in '{zip_text}'"),
        })?;

        let price = self.normalize_price(raw.price)?;

        let type_text = non_empty(raw.property_type_text.as_deref())
            .ok_or(NormalizeError::MissingField("property_type"))?;
        let property_type = property_type_from_text(type_text);

        let state = non_empty(raw.state.as_deref())
            .map(normalize_state)
            .unwrap_or_default();

        let location = match (raw.latitude, raw.longitude) {
            (Some(latitude), Some(longitude))
                if (-90.0..=90.0).contains(&latitude)
                    && (-180.0..=180.0).contains(&longitude)
                    && !(latitude == 0.0 && longitude == 0.0) =>
            {
                Some(GeoPoint {
                    latitude,
                    longitude,
                })
            }
            _ => None,
        };

        let image_urls = dedup_urls(raw.primary_image_url.iter().chain(raw.image_urls.iter()));
        let primary_image_url = image_urls.first().cloned();

        let hoa_monthly_fee = raw
            .hoa_fee
            .filter(|fee| fee.amount.is_finite() && fee.amount >= 0.0)
            .map(|fee| monthly_fee(fee.amount, fee.frequency));
        let has_hoa = raw
            .has_hoa
            .or_else(|| hoa_monthly_fee.map(|fee| fee > 0.0));

        Ok(NormalizedProperty {
            id: Uuid::new_v4(),
            mls_number: raw.mls_number.as_deref().and_then(normalize_mls_number),
            address: Address {
                street,
                unit,
                city,
                state,
                zip,
                county: non_empty(raw.county.as_deref()).map(normalize_county),
            },
            location,
            price,
            status: status_from_text(raw.status_text.as_deref()),
            days_on_market: raw.days_on_market.and_then(|d| u32::try_from(d).ok()),
            property_type,
            bedrooms: non_negative(raw.bedrooms),
            bathrooms: non_negative(raw.bathrooms),
            square_feet: raw.square_feet.and_then(positive_u32),
            lot_square_feet: raw.lot_size.and_then(lot_square_feet),
            year_built: self.normalize_year(raw.year_built, raw.scraped_at.year()),
            has_pool: raw.has_pool,
            garage_spaces: raw.garage_spaces.and_then(|g| u8::try_from(g).ok()),
            has_hoa,
            hoa_monthly_fee,
            schools: Schools {
                elementary: raw.elementary_school.as_deref().and_then(normalize_school),
                middle: raw.middle_school.as_deref().and_then(normalize_school),
                high: raw.high_school.as_deref().and_then(normalize_school),
                district: non_empty(raw.school_district.as_deref()).map(collapse_whitespace),
            },
            primary_image_url,
            image_urls,
            listing_urls: BTreeMap::from([(raw.source, raw.source_url.clone())]),
            data_sources: BTreeSet::from([raw.source]),
            source_history: Vec::new(),
            last_scraped_at: raw.scraped_at,
        })
    }

    fn normalize_price(&self, price: Option<f64>) -> Result<u64, NormalizeError> {
        let price = price
            .filter(|p| p.is_finite())
            .ok_or(NormalizeError::MissingField("price"))?;
        if price < self.config.min_price || price > self.config.max_price {
            return Err(NormalizeError::InvalidField {
                field: "price",
                reason: format!(
                    "{price} outside [{}, {}]",
                    self.config.min_price, self.config.max_price
                ),
            });
        }
        Ok(price.round() as u64)
    }

    fn normalize_year(&self, year: Option<i32>, scrape_year: i32) -> Option<u16> {
        let year = year?;
        let max = scrape_year + self.config.future_year_slack;
        if year < self.config.min_year_built || year > max {
            return None;
        }
        u16::try_from(year).ok()
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn title_word(word: &str) -> String {
    if word.chars().any(|c| c.is_ascii_digit()) {
        return word.to_lowercase();
    }
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// "  SUN   city west " -> "Sun City West".
pub fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(title_word)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical street line plus any unit designator found at its end.
///
/// "1234 north central avenue, apt 5" -> ("1234 N Central Ave", Some("5"))
pub fn normalize_street(line: &str) -> (String, Option<String>) {
    let line = collapse_whitespace(line);
    let (mut line, unit) = match UNIT_RE.captures(&line) {
        Some(caps) => {
            let unit = caps.get(1).map(|m| normalize_unit(m.as_str()));
            let start = caps.get(0).map_or(line.len(), |m| m.start());
            (line[..start].to_string(), unit)
        }
        None => (line.clone(), None),
    };
    // Anything after a comma is city/state/zip leaking into the street line.
    if let Some(idx) = line.find(',') {
        line.truncate(idx);
    }

    let mut words: Vec<String> = line
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| c == '.' || c == ','))
        .filter(|w| !w.is_empty())
        .map(title_word)
        .collect();

    let n = words.len();
    if n == 0 {
        return (String::new(), unit);
    }

    // Trailing directional ("Main St NW") only counts after a suffix.
    let mut suffix_idx = n - 1;
    if n >= 3
        && lookup(DIRECTIONALS, &words[n - 1]).is_some()
        && lookup(STREET_SUFFIXES, &words[n - 2]).is_some()
    {
        if let Some(abbr) = lookup(DIRECTIONALS, &words[n - 1]) {
            words[n - 1] = abbr.to_string();
        }
        suffix_idx = n - 2;
    }
    if suffix_idx >= 1
        && let Some(abbr) = lookup(STREET_SUFFIXES, &words[suffix_idx])
    {
        words[suffix_idx] = abbr.to_string();
    }

    // Leading directional after the house number, unless it is the street
    // name itself ("100 North St").
    let starts_with_number = words[0].chars().next().is_some_and(|c| c.is_ascii_digit());
    if starts_with_number
        && suffix_idx >= 3
        && let Some(abbr) = lookup(DIRECTIONALS, &words[1])
    {
        words[1] = abbr.to_string();
    }

    (words.join(" "), unit)
}

fn normalize_unit(unit: &str) -> String {
    unit.trim()
        .trim_start_matches('#')
        .trim()
        .to_uppercase()
}

/// First 5-digit run, e.g. "85004-1234" -> "85004".
pub fn normalize_zip(zip: &str) -> Option<String> {
    ZIP_RE.find(zip).map(|m| m.as_str().to_string())
}

fn normalize_state(state: &str) -> String {
    let collapsed = collapse_whitespace(state);
    if collapsed.len() == 2 {
        return collapsed.to_uppercase();
    }
    lookup(STATES, &collapsed)
        .map(str::to_string)
        .unwrap_or_else(|| collapsed.to_uppercase())
}

fn normalize_county(county: &str) -> String {
    let titled = title_case(county);
    titled
        .strip_suffix(" County")
        .map(str::to_string)
        .unwrap_or(titled)
}

/// Strip listing-service prefixes and punctuation; `None` if nothing is left
/// or the result is longer than any real MLS number.
pub fn normalize_mls_number(mls: &str) -> Option<String> {
    let upper = mls.trim().to_uppercase();
    let stripped = MLS_PREFIX_RE.replace(&upper, "");
    let cleaned: String = stripped.chars().filter(char::is_ascii_alphanumeric).collect();
    (!cleaned.is_empty() && cleaned.len() <= MAX_MLS_LEN).then_some(cleaned)
}

pub fn status_from_text(text: Option<&str>) -> ListingStatus {
    let Some(text) = non_empty(text) else {
        return ListingStatus::Active;
    };
    let t = text.to_lowercase();
    if t.contains("coming soon") {
        ListingStatus::ComingSoon
    } else if t.contains("pending") || t.contains("contingent") || t.contains("under contract") {
        ListingStatus::Pending
    } else if t.contains("sold") || t.contains("closed") {
        ListingStatus::Sold
    } else if t.contains("off market")
        || t.contains("off-market")
        || t.contains("withdrawn")
        || t.contains("expired")
        || t.contains("cancel")
    {
        ListingStatus::OffMarket
    } else {
        ListingStatus::Active
    }
}

pub fn property_type_from_text(text: &str) -> PropertyType {
    let t = text.to_lowercase();
    if t.contains("condo") {
        PropertyType::Condo
    } else if t.contains("townhouse") || t.contains("townhome") {
        PropertyType::Townhouse
    } else if t.contains("multi") || t.contains("duplex") || t.contains("triplex") || t.contains("fourplex") {
        PropertyType::MultiFamily
    } else if t.contains("manufactured") || t.contains("mobile") {
        PropertyType::Manufactured
    } else if t.contains("land") || LOT_WORD_RE.is_match(&t) {
        PropertyType::Land
    } else if t.contains("single") || t.contains("house") || t.contains("residential") {
        PropertyType::SingleFamily
    } else {
        PropertyType::Other
    }
}

fn non_negative(value: Option<f32>) -> Option<f32> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

fn positive_u32(value: f64) -> Option<u32> {
    (value.is_finite() && value > 0.0 && value <= u32::MAX as f64).then(|| value.round() as u32)
}

fn lot_square_feet(lot: LotSize) -> Option<u32> {
    let sqft = match lot.unit {
        LotUnit::Acres => lot.value * SQFT_PER_ACRE,
        LotUnit::SqFt => lot.value,
        LotUnit::Unknown if lot.value < ACRES_THRESHOLD => lot.value * SQFT_PER_ACRE,
        LotUnit::Unknown => lot.value,
    };
    positive_u32(sqft)
}

fn monthly_fee(amount: f64, frequency: Option<FeeFrequency>) -> f64 {
    let divisor = match frequency.unwrap_or(FeeFrequency::Monthly) {
        FeeFrequency::Monthly => 1.0,
        FeeFrequency::Quarterly => 3.0,
        FeeFrequency::SemiAnnually => 6.0,
        FeeFrequency::Annually => 12.0,
    };
    ((amount / divisor) * 100.0).round() / 100.0
}

fn normalize_school(name: &str) -> Option<String> {
    let collapsed = collapse_whitespace(name);
    if collapsed.is_empty() {
        return None;
    }
    let tidied = SCHOOL_LEVEL_RE.replace(&collapsed, |caps: &Captures<'_>| {
        match caps[1].to_ascii_lowercase().as_str() {
            "elementary" => "Elementary",
            "middle" => "Middle",
            _ => "High",
        }
    });
    Some(tidied.trim().to_string())
}

fn dedup_urls<'a>(urls: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.map(|u| u.trim())
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .filter(|u| seen.insert(u.to_string()))
        .map(str::to_string)
        .collect()
}
