use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A listing website this pipeline knows how to scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "zillow")]
    Zillow,
    #[serde(rename = "redfin")]
    Redfin,
    #[serde(rename = "homes.com")]
    HomesCom,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Zillow, Source::Redfin, Source::HomesCom];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Zillow => "zillow",
            Source::Redfin => "redfin",
            Source::HomesCom => "homes.com",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zillow" => Ok(Source::Zillow),
            "redfin" => Ok(Source::Redfin),
            "homes.com" | "homes" | "homescom" => Ok(Source::HomesCom),
            _ => Err(format!("Unknown source: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw (adapter output)
// ---------------------------------------------------------------------------

/// Unit a lot size was published in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LotUnit {
    Acres,
    SqFt,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LotSize {
    pub value: f64,
    pub unit: LotUnit,
}

/// How often a published HOA fee is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeFrequency {
    Monthly,
    Quarterly,
    SemiAnnually,
    Annually,
}

impl FeeFrequency {
    /// Parse frequency wording as sites print it ("/mo", "per year", "quarterly").
    pub fn from_text(text: &str) -> Option<Self> {
        let t = text.to_lowercase();
        if t.contains("semi") || t.contains("bi-annual") || t.contains("biannual") {
            Some(FeeFrequency::SemiAnnually)
        } else if t.contains("quarter") || t.contains("/qtr") {
            Some(FeeFrequency::Quarterly)
        } else if t.contains("year") || t.contains("annual") || t.contains("/yr") {
            Some(FeeFrequency::Annually)
        } else if t.contains("month") || t.contains("/mo") {
            Some(FeeFrequency::Monthly)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoaFee {
    pub amount: f64,
    pub frequency: Option<FeeFrequency>,
}

/// A listing as one adapter parsed it, before any harmonization.
///
/// Values are kept the way the site published them (status wording, type
/// wording, lot units, fee frequency); the normalizer owns the cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListingRecord {
    pub source: Source,
    pub source_url: String,
    pub source_listing_id: Option<String>,

    pub address_line: Option<String>,
    pub unit: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub county: Option<String>,

    pub price: Option<f64>,
    pub status_text: Option<String>,
    pub days_on_market: Option<i64>,

    pub property_type_text: Option<String>,
    pub bedrooms: Option<f32>,
    pub bathrooms: Option<f32>,
    pub square_feet: Option<f64>,
    pub lot_size: Option<LotSize>,
    pub year_built: Option<i32>,

    pub has_pool: Option<bool>,
    pub garage_spaces: Option<i32>,
    pub has_hoa: Option<bool>,
    pub hoa_fee: Option<HoaFee>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    pub elementary_school: Option<String>,
    pub middle_school: Option<String>,
    pub high_school: Option<String>,
    pub school_district: Option<String>,

    pub primary_image_url: Option<String>,
    pub image_urls: Vec<String>,
    pub mls_number: Option<String>,

    /// Site payload kept for diagnostics only.
    pub raw: serde_json::Value,
    pub scraped_at: DateTime<Utc>,
}

impl RawListingRecord {
    /// An empty record for `source_url`; adapters fill in what they parse.
    pub fn new(source: Source, source_url: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        Self {
            source,
            source_url: source_url.into(),
            source_listing_id: None,
            address_line: None,
            unit: None,
            city: None,
            state: None,
            zip_code: None,
            county: None,
            price: None,
            status_text: None,
            days_on_market: None,
            property_type_text: None,
            bedrooms: None,
            bathrooms: None,
            square_feet: None,
            lot_size: None,
            year_built: None,
            has_pool: None,
            garage_spaces: None,
            has_hoa: None,
            hoa_fee: None,
            latitude: None,
            longitude: None,
            elementary_school: None,
            middle_school: None,
            high_school: None,
            school_district: None,
            primary_image_url: None,
            image_urls: Vec::new(),
            mls_number: None,
            raw: serde_json::Value::Null,
            scraped_at,
        }
    }
}

/// Result of a criteria search against one source.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub records: Vec<RawListingRecord>,
    /// Number of listings the site reported, parsed or not.
    pub total_found: usize,
    /// One message per listing card that failed to parse.
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Canonical property
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingStatus {
    Active,
    Pending,
    Sold,
    OffMarket,
    ComingSoon,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Pending => "pending",
            ListingStatus::Sold => "sold",
            ListingStatus::OffMarket => "off-market",
            ListingStatus::ComingSoon => "coming-soon",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ListingStatus::Active),
            "pending" => Ok(ListingStatus::Pending),
            "sold" => Ok(ListingStatus::Sold),
            "off-market" => Ok(ListingStatus::OffMarket),
            "coming-soon" => Ok(ListingStatus::ComingSoon),
            _ => Err(format!("Unknown listing status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyType {
    SingleFamily,
    Condo,
    Townhouse,
    MultiFamily,
    Manufactured,
    Land,
    /// Published, but not in a category we recognize.
    Other,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::SingleFamily => "single-family",
            PropertyType::Condo => "condo",
            PropertyType::Townhouse => "townhouse",
            PropertyType::MultiFamily => "multi-family",
            PropertyType::Manufactured => "manufactured",
            PropertyType::Land => "land",
            PropertyType::Other => "other",
        }
    }

    pub fn is_specific(&self) -> bool {
        !matches!(self, PropertyType::Other)
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-family" => Ok(PropertyType::SingleFamily),
            "condo" => Ok(PropertyType::Condo),
            "townhouse" => Ok(PropertyType::Townhouse),
            "multi-family" => Ok(PropertyType::MultiFamily),
            "manufactured" => Ok(PropertyType::Manufactured),
            "land" => Ok(PropertyType::Land),
            "other" => Ok(PropertyType::Other),
            _ => Err(format!("Unknown property type: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub unit: Option<String>,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub county: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schools {
    pub elementary: Option<String>,
    pub middle: Option<String>,
    pub high: Option<String>,
    pub district: Option<String>,
}

/// One contribution of a source to a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHistoryEntry {
    pub source: Source,
    pub scraped_at: DateTime<Utc>,
    pub changed_fields: Vec<String>,
}

/// The canonical property record shared by every contributing source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedProperty {
    pub id: Uuid,
    pub mls_number: Option<String>,
    pub address: Address,
    pub location: Option<GeoPoint>,

    /// List price in whole dollars.
    pub price: u64,
    pub status: ListingStatus,
    pub days_on_market: Option<u32>,

    pub property_type: PropertyType,
    pub bedrooms: Option<f32>,
    pub bathrooms: Option<f32>,
    pub square_feet: Option<u32>,
    pub lot_square_feet: Option<u32>,
    pub year_built: Option<u16>,

    pub has_pool: Option<bool>,
    pub garage_spaces: Option<u8>,
    pub has_hoa: Option<bool>,
    pub hoa_monthly_fee: Option<f64>,

    pub schools: Schools,

    pub primary_image_url: Option<String>,
    pub image_urls: Vec<String>,
    pub listing_urls: BTreeMap<Source, String>,

    pub data_sources: BTreeSet<Source>,
    pub source_history: Vec<SourceHistoryEntry>,
    pub last_scraped_at: DateTime<Utc>,
}

impl NormalizedProperty {
    /// Re-check the hard requirements a stored property must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.address.street.trim().is_empty() {
            return Err("street address is empty".into());
        }
        if self.address.city.trim().is_empty() {
            return Err("city is empty".into());
        }
        if self.address.zip.len() != 5 || !self.address.zip.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("zip '{}' is not a 5-digit code", self.address.zip));
        }
        if self.price == 0 {
            return Err("price is zero".into());
        }
        if self.data_sources.is_empty() {
            return Err("property has no data source".into());
        }
        Ok(())
    }
}
