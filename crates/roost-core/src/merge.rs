//! Identity resolution and field-level merging of canonical properties.
//!
//! Two records describe the same property when their MLS numbers match, or,
//! failing that, when their canonical addresses match and their MLS numbers
//! do not contradict each other.
//!
//! Merging keeps the freshest value of fields that change over a listing's
//! life (price, status, days on market) and the most complete value of
//! everything else. A contribution is identified by `(source, scraped_at)`;
//! merging one twice is a no-op.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Address, NormalizedProperty, PropertyType, Source, SourceHistoryEntry};

/// Address part of a property's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressKey {
    pub street: String,
    pub unit: Option<String>,
    pub zip: String,
}

impl AddressKey {
    pub fn of(address: &Address) -> Self {
        Self {
            street: address.street.trim().to_lowercase(),
            unit: address
                .unit
                .as_deref()
                .map(|u| u.trim().to_lowercase())
                .filter(|u| !u.is_empty()),
            zip: address.zip.trim().to_string(),
        }
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.street,
            self.unit.as_deref().unwrap_or(""),
            self.zip
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub mls: Option<String>,
    pub address: AddressKey,
}

impl IdentityKey {
    pub fn of(property: &NormalizedProperty) -> Self {
        Self {
            mls: property.mls_number.clone(),
            address: AddressKey::of(&property.address),
        }
    }
}

/// Whether `a` and `b` are records of the same property.
pub fn is_duplicate(a: &NormalizedProperty, b: &NormalizedProperty) -> bool {
    if let (Some(x), Some(y)) = (&a.mls_number, &b.mls_number) {
        return x == y;
    }
    AddressKey::of(&a.address) == AddressKey::of(&b.address)
}

/// Pick the stored record `incoming` should merge into.
///
/// An MLS match wins. An address match is rejected when both sides carry
/// different MLS numbers: that is a relisting or a different unit, not the
/// same listing.
pub fn resolve(
    by_mls: Option<NormalizedProperty>,
    by_address: Option<NormalizedProperty>,
    incoming: &NormalizedProperty,
) -> Option<NormalizedProperty> {
    if by_mls.is_some() {
        return by_mls;
    }
    let candidate = by_address?;
    match (&candidate.mls_number, &incoming.mls_number) {
        (Some(existing), Some(new)) if existing != new => {
            tracing::debug!(
                address = %AddressKey::of(&incoming.address),
                existing_mls = %existing,
                incoming_mls = %new,
                "Address match rejected on conflicting MLS numbers"
            );
            None
        }
        _ => Some(candidate),
    }
}

/// Merge one source's contribution into the stored record, if any.
pub fn merge(
    existing: Option<&NormalizedProperty>,
    incoming: &NormalizedProperty,
    source: Source,
    scraped_at: DateTime<Utc>,
) -> NormalizedProperty {
    let Some(existing) = existing else {
        let mut created = incoming.clone();
        created.data_sources.insert(source);
        created.last_scraped_at = scraped_at;
        if !has_entry(&created, source, scraped_at) {
            let changed_fields = populated_fields(&created);
            created.source_history.push(SourceHistoryEntry {
                source,
                scraped_at,
                changed_fields,
            });
        }
        return created;
    };

    if has_entry(existing, source, scraped_at) {
        return existing.clone();
    }

    let newer = scraped_at >= existing.last_scraped_at;
    let mut merged = existing.clone();

    // Fields that change over a listing's life: freshest wins.
    if newer {
        merged.price = incoming.price;
        merged.status = incoming.status;
        merged.days_on_market = incoming.days_on_market.or(existing.days_on_market);
    } else {
        merged.days_on_market = existing.days_on_market.or(incoming.days_on_market);
    }

    // Characterization: completeness first, freshness breaks ties.
    merged.mls_number = pick(&existing.mls_number, &incoming.mls_number, newer);
    merged.address = Address {
        street: pick_text(&existing.address.street, &incoming.address.street, newer),
        unit: pick(&existing.address.unit, &incoming.address.unit, newer),
        city: pick_text(&existing.address.city, &incoming.address.city, newer),
        state: pick_text(&existing.address.state, &incoming.address.state, newer),
        zip: pick_text(&existing.address.zip, &incoming.address.zip, newer),
        county: pick(&existing.address.county, &incoming.address.county, newer),
    };
    merged.location = pick(&existing.location, &incoming.location, newer);
    merged.property_type = pick_type(existing.property_type, incoming.property_type, newer);
    merged.bedrooms = pick(&existing.bedrooms, &incoming.bedrooms, newer);
    merged.bathrooms = pick(&existing.bathrooms, &incoming.bathrooms, newer);
    merged.square_feet = pick(&existing.square_feet, &incoming.square_feet, newer);
    merged.lot_square_feet = pick(&existing.lot_square_feet, &incoming.lot_square_feet, newer);
    merged.year_built = pick(&existing.year_built, &incoming.year_built, newer);
    merged.has_pool = pick(&existing.has_pool, &incoming.has_pool, newer);
    merged.garage_spaces = pick(&existing.garage_spaces, &incoming.garage_spaces, newer);
    merged.has_hoa = pick(&existing.has_hoa, &incoming.has_hoa, newer);
    merged.hoa_monthly_fee = pick(&existing.hoa_monthly_fee, &incoming.hoa_monthly_fee, newer);
    merged.schools.elementary = pick(&existing.schools.elementary, &incoming.schools.elementary, newer);
    merged.schools.middle = pick(&existing.schools.middle, &incoming.schools.middle, newer);
    merged.schools.high = pick(&existing.schools.high, &incoming.schools.high, newer);
    merged.schools.district = pick(&existing.schools.district, &incoming.schools.district, newer);
    merged.primary_image_url = pick(&existing.primary_image_url, &incoming.primary_image_url, newer);

    // Collections: union.
    for url in &incoming.image_urls {
        if !merged.image_urls.contains(url) {
            merged.image_urls.push(url.clone());
        }
    }
    for (listing_source, url) in &incoming.listing_urls {
        if newer || !merged.listing_urls.contains_key(listing_source) {
            merged.listing_urls.insert(*listing_source, url.clone());
        }
    }
    merged.data_sources.extend(incoming.data_sources.iter().copied());
    merged.data_sources.insert(source);

    merged.last_scraped_at = existing.last_scraped_at.max(scraped_at);

    let changed_fields = changed_fields(existing, &merged);
    merged.source_history.push(SourceHistoryEntry {
        source,
        scraped_at,
        changed_fields,
    });
    merged
}

fn has_entry(property: &NormalizedProperty, source: Source, scraped_at: DateTime<Utc>) -> bool {
    property
        .source_history
        .iter()
        .any(|e| e.source == source && e.scraped_at == scraped_at)
}

fn pick<T: Clone>(existing: &Option<T>, incoming: &Option<T>, incoming_newer: bool) -> Option<T> {
    match (existing, incoming) {
        (Some(_), Some(new)) if incoming_newer => Some(new.clone()),
        (Some(old), _) => Some(old.clone()),
        (None, new) => new.clone(),
    }
}

fn pick_text(existing: &str, incoming: &str, incoming_newer: bool) -> String {
    match (existing.is_empty(), incoming.is_empty()) {
        (false, false) if incoming_newer => incoming.to_string(),
        (false, _) => existing.to_string(),
        (true, _) => incoming.to_string(),
    }
}

fn pick_type(existing: PropertyType, incoming: PropertyType, incoming_newer: bool) -> PropertyType {
    match (existing.is_specific(), incoming.is_specific()) {
        (true, true) if incoming_newer => incoming,
        (true, _) => existing,
        (false, _) => incoming,
    }
}

/// Names of the fields a freshly created record carries.
fn populated_fields(p: &NormalizedProperty) -> Vec<String> {
    let mut fields: Vec<&str> = vec!["address", "price", "status", "property_type"];
    let optional = [
        ("mls_number", p.mls_number.is_some()),
        ("location", p.location.is_some()),
        ("days_on_market", p.days_on_market.is_some()),
        ("bedrooms", p.bedrooms.is_some()),
        ("bathrooms", p.bathrooms.is_some()),
        ("square_feet", p.square_feet.is_some()),
        ("lot_square_feet", p.lot_square_feet.is_some()),
        ("year_built", p.year_built.is_some()),
        ("has_pool", p.has_pool.is_some()),
        ("garage_spaces", p.garage_spaces.is_some()),
        ("has_hoa", p.has_hoa.is_some()),
        ("hoa_monthly_fee", p.hoa_monthly_fee.is_some()),
        ("schools", p.schools != Default::default()),
        ("image_urls", !p.image_urls.is_empty()),
    ];
    fields.extend(optional.iter().filter(|(_, set)| *set).map(|(name, _)| *name));
    fields.into_iter().map(str::to_string).collect()
}

fn changed_fields(before: &NormalizedProperty, after: &NormalizedProperty) -> Vec<String> {
    let checks = [
        ("mls_number", before.mls_number != after.mls_number),
        ("address", before.address != after.address),
        ("location", before.location != after.location),
        ("price", before.price != after.price),
        ("status", before.status != after.status),
        ("days_on_market", before.days_on_market != after.days_on_market),
        ("property_type", before.property_type != after.property_type),
        ("bedrooms", before.bedrooms != after.bedrooms),
        ("bathrooms", before.bathrooms != after.bathrooms),
        ("square_feet", before.square_feet != after.square_feet),
        ("lot_square_feet", before.lot_square_feet != after.lot_square_feet),
        ("year_built", before.year_built != after.year_built),
        ("has_pool", before.has_pool != after.has_pool),
        ("garage_spaces", before.garage_spaces != after.garage_spaces),
        ("has_hoa", before.has_hoa != after.has_hoa),
        ("hoa_monthly_fee", before.hoa_monthly_fee != after.hoa_monthly_fee),
        ("schools", before.schools != after.schools),
        ("primary_image_url", before.primary_image_url != after.primary_image_url),
        ("image_urls", before.image_urls != after.image_urls),
        ("listing_urls", before.listing_urls != after.listing_urls),
        ("data_sources", before.data_sources != after.data_sources),
    ];
    checks
        .into_iter()
        .filter(|(_, changed)| *changed)
        .map(|(name, _)| name.to_string())
        .collect()
}
