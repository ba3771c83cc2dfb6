//! HTML helpers shared by the site adapters.
//!
//! Everything here works on `scraper` element references and returns plain
//! strings and numbers; turning them into a [`RawListingRecord`] is each
//! adapter's job.
//!
//! [`RawListingRecord`]: roost_core::models::RawListingRecord

use std::sync::LazyLock;

use regex::Regex;
use roost_core::error::AdapterError;
use roost_core::models::{FeeFrequency, HoaFee, LotSize, LotUnit};
use scraper::{ElementRef, Selector};
use url::Url;

static LATITUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""latitude"\s*:\s*(-?\d+(?:\.\d+)?)"#).expect("valid regex"));
static LONGITUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""longitude"\s*:\s*(-?\d+(?:\.\d+)?)"#).expect("valid regex"));
static GARAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)[\s-]*(?:car|space)").expect("valid regex"));

/// Phrases that only show up on bot-detection interstitials.
const BOT_WALL_MARKERS: &[&str] = &[
    "px-captcha",
    "captcha-container",
    "g-recaptcha",
    "h-captcha",
    "press & hold",
    "are you a human",
    "access to this page has been denied",
    "unusual traffic from your computer",
    "cf-challenge",
    "verify you are human",
];

pub fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("bad selector '{css}': {e}")))
}

/// Text content with whitespace collapsed; `None` when blank.
pub fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Text of the first element matching any of `selectors`, tried in order.
pub fn first_text(scope: ElementRef<'_>, selectors: &[&str]) -> Result<Option<String>, AdapterError> {
    for css in selectors {
        let sel = selector(css)?;
        if let Some(text) = scope.select(&sel).find_map(element_text) {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

pub fn all_texts(scope: ElementRef<'_>, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).filter_map(element_text).collect())
}

pub fn attr_values(scope: ElementRef<'_>, css: &str, attr: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope
        .select(&sel)
        .filter_map(|el| el.value().attr(attr))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect())
}

/// Label/value pairs from fact lists like
/// `<div class="keyDetail"><span class="header">Year Built</span><span class="content">1999</span></div>`.
pub fn labeled_values(
    scope: ElementRef<'_>,
    item_css: &str,
    label_css: &str,
    value_css: &str,
) -> Result<Vec<(String, String)>, AdapterError> {
    let item = selector(item_css)?;
    let label = selector(label_css)?;
    let value = selector(value_css)?;
    Ok(scope
        .select(&item)
        .filter_map(|el| {
            let l = el.select(&label).find_map(element_text)?;
            let v = el.select(&value).find_map(element_text)?;
            Some((l, v))
        })
        .collect())
}

/// Value of the first pair whose label contains `needle` (case-insensitive).
pub fn lookup<'a>(pairs: &'a [(String, String)], needle: &str) -> Option<&'a str> {
    let needle = needle.to_lowercase();
    pairs
        .iter()
        .find(|(label, _)| label.to_lowercase().contains(&needle))
        .map(|(_, value)| value.as_str())
}

/// First number in `text`, ignoring currency symbols and thousands separators.
///
/// `"$450,000"` → 450000, `"2.5 ba"` → 2.5, `"—"` → `None`.
pub fn parse_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let negative = text[..start].ends_with('-');
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(|c| *c != ',')
        .collect();
    let value: f64 = digits.trim_end_matches('.').parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Like [`parse_number`], but understands `K`/`M` suffixes as search cards
/// print them (`"$1.2M"`).
pub fn parse_price(text: &str) -> Option<f64> {
    let value = parse_number(text)?;
    let upper = text.to_uppercase();
    let multiplier = if upper.trim_end().ends_with('M') {
        1_000_000.0
    } else if upper.trim_end().ends_with('K') {
        1_000.0
    } else {
        1.0
    };
    Some(value * multiplier)
}

/// Split `"Phoenix, AZ 85004"` into city, state and zip.
pub fn split_city_state_zip(text: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut parts = text.splitn(2, ',').map(str::trim);
    let city = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let Some(rest) = parts.next() else {
        return (city, None, None);
    };
    let mut tokens = rest.split_whitespace();
    let state = tokens.next().map(str::to_string);
    let zip = tokens.next().map(str::to_string);
    (city, state, zip)
}

/// Parsed form of a one-line address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressParts {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

/// Split `"123 Main St, Phoenix, AZ 85004"`.
pub fn split_full_address(text: &str) -> AddressParts {
    let Some((street, rest)) = text.split_once(',') else {
        return AddressParts {
            street: Some(text.trim().to_string()).filter(|s| !s.is_empty()),
            ..Default::default()
        };
    };
    let (city, state, zip) = split_city_state_zip(rest.trim());
    AddressParts {
        street: Some(street.trim().to_string()).filter(|s| !s.is_empty()),
        city,
        state,
        zip,
    }
}

/// `"0.25 Acres"` or `"7,405 sq ft"`.
pub fn parse_lot_size(text: &str) -> Option<LotSize> {
    let value = parse_number(text)?;
    let unit = if text.to_lowercase().contains("acre") {
        LotUnit::Acres
    } else {
        LotUnit::SqFt
    };
    Some(LotSize { value, unit })
}

/// HOA wording into `(has_hoa, fee)`. `"No HOA"` and `"None"` mean no HOA.
pub fn parse_hoa(text: &str) -> (Option<bool>, Option<HoaFee>) {
    let lower = text.to_lowercase();
    if lower.contains("no hoa") || lower.trim() == "none" || lower.trim() == "no" {
        return (Some(false), None);
    }
    match parse_number(text) {
        Some(amount) if amount > 0.0 => (
            Some(true),
            Some(HoaFee {
                amount,
                frequency: FeeFrequency::from_text(text),
            }),
        ),
        _ => (None, None),
    }
}

pub fn parse_garage_spaces(text: &str) -> Option<i32> {
    GARAGE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Coordinates embedded in inline JSON (`"latitude": 33.45`).
pub fn extract_coordinates(html: &str) -> Option<(f64, f64)> {
    let lat = LATITUDE_RE.captures(html)?.get(1)?.as_str().parse().ok()?;
    let lng = LONGITUDE_RE.captures(html)?.get(1)?.as_str().parse().ok()?;
    Some((lat, lng))
}

/// Returns the matched marker when `html` looks like a bot-detection page.
pub fn detect_bot_wall(html: &str) -> Option<&'static str> {
    let lower = html.to_lowercase();
    BOT_WALL_MARKERS
        .iter()
        .copied()
        .find(|marker| lower.contains(marker))
}

/// Resolve `href` against `base`, keeping only http(s) results.
pub fn absolute_url(base: &Url, href: &str) -> Option<String> {
    let joined = base.join(href).ok()?;
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn test_parse_number_variants() {
        assert_eq!(parse_number("$450,000"), Some(450_000.0));
        assert_eq!(parse_number("2.5 ba"), Some(2.5));
        assert_eq!(parse_number("1,800 sqft"), Some(1_800.0));
        assert_eq!(parse_number("Built in 1999."), Some(1_999.0));
        assert_eq!(parse_number("—"), None);
        assert_eq!(parse_price("$1.2M"), Some(1_200_000.0));
        assert_eq!(parse_price("$950K"), Some(950_000.0));
    }

    #[test]
    fn test_address_splitting() {
        assert_eq!(
            split_city_state_zip("Phoenix, AZ 85004"),
            (Some("Phoenix".into()), Some("AZ".into()), Some("85004".into()))
        );
        let parts = split_full_address("123 Main St, Paradise Valley, AZ 85253");
        assert_eq!(parts.street.as_deref(), Some("123 Main St"));
        assert_eq!(parts.city.as_deref(), Some("Paradise Valley"));
        assert_eq!(parts.zip.as_deref(), Some("85253"));
        assert_eq!(split_full_address("123 Main St").city, None);
    }

    #[test]
    fn test_lot_and_hoa() {
        assert_eq!(
            parse_lot_size("0.25 Acres"),
            Some(LotSize { value: 0.25, unit: LotUnit::Acres })
        );
        assert_eq!(parse_lot_size("7,405 sq ft").map(|l| l.unit), Some(LotUnit::SqFt));

        assert_eq!(parse_hoa("No HOA Dues"), (Some(false), None));
        let (has, fee) = parse_hoa("$150/month");
        assert_eq!(has, Some(true));
        assert_eq!(fee.unwrap().frequency, Some(FeeFrequency::Monthly));
        assert_eq!(parse_garage_spaces("2-car attached garage"), Some(2));
    }

    #[test]
    fn test_bot_wall_detection() {
        assert_eq!(
            detect_bot_wall("<div id=\"px-captcha\"></div>"),
            Some("px-captcha")
        );
        assert!(detect_bot_wall("<h1>Access to this page has been denied</h1>").is_some());
        assert!(detect_bot_wall("<h1>3 bd 2 ba</h1>").is_none());
    }

    #[test]
    fn test_labeled_values_and_lookup() {
        let doc = Html::parse_document(
            r#"<ul>
                <li class="fact"><span class="l">Year Built</span><span class="v">1999</span></li>
                <li class="fact"><span class="l">MLS#</span><span class="v"> 6543210 </span></li>
            </ul>"#,
        );
        let pairs = labeled_values(doc.root_element(), ".fact", ".l", ".v").unwrap();
        assert_eq!(lookup(&pairs, "year built"), Some("1999"));
        assert_eq!(lookup(&pairs, "mls"), Some("6543210"));
        assert_eq!(lookup(&pairs, "lot"), None);
    }

    #[test]
    fn test_coordinates_and_urls() {
        let html = r#"<script>{"latitude": 33.4484, "longitude": -112.074}</script>"#;
        assert_eq!(extract_coordinates(html), Some((33.4484, -112.074)));

        let base = Url::parse("https://www.redfin.com/zipcode/85004").unwrap();
        assert_eq!(
            absolute_url(&base, "/AZ/Phoenix/1-Main-St/home/1").as_deref(),
            Some("https://www.redfin.com/AZ/Phoenix/1-Main-St/home/1")
        );
        assert_eq!(absolute_url(&base, "javascript:void(0)"), None);
    }
}
