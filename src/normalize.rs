//! Candidate cleanup: prices, names, brands, categories and URLs.
//!
//! Turns a [`RawRecord`] into a [`NormalizedRecord`] or explains why it can't.
//! Only a missing name or an unusable price rejects a record; every other
//! field degrades to a default.

use crate::error::NormalizationFailure;
use crate::models::{Category, NormalizedRecord, Price, RawRecord};
use crate::sources::SourceConfig;
use crate::utils::collapse_whitespace;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// First amount in a price string: `1,299.00`, `24.99`, `24`, `.99`.
static AMOUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?|\.\d+").unwrap());

/// A minus sign in front of the amount, optionally before the currency.
static NEGATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w])[-\u{2212}]\s*(?:[$€£]|[A-Z]{3})?\s*[\d.]").unwrap());

static ISO_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(USD|EUR|GBP|CAD|AUD)\b").unwrap());

/// Brands recognised inside retailer product names.
static KNOWN_BRANDS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        "Clearblue",
        "First Response",
        "Pregmate",
        "Easy@Home",
        "Proov",
        "Inito",
        "Mira",
        "Wisp",
        "Everlywell",
        "LetsGetChecked",
        "Nurx",
        "Stix",
        "MomMed",
        "Modern Fertility",
        "Natalist",
    ]
    .into_iter()
    .map(|brand| {
        let pattern = format!(r"(?i)(?:^|[^\w@]){}(?:$|[^\w@])", regex::escape(brand));
        (brand, Regex::new(&pattern).unwrap())
    })
    .collect()
});

/// Keyword table, checked in order; the first matching category wins.
static CATEGORY_KEYWORDS: Lazy<Vec<(Category, Regex)>> = Lazy::new(|| {
    [
        (Category::Pregnancy, r"pregnan\w*"),
        (Category::Pcos, r"pcos|polycystic"),
        (Category::OvulationFertility, r"ovulat\w*|fertility|lh surge|lh tests?"),
        (
            Category::Sti,
            r"stis?|stds?|chlamydia|gonorrh?ea|hiv|herpes|syphilis|trichomoniasis",
        ),
        (Category::Menopause, r"menopause|perimenopause|fsh"),
        (Category::Thyroid, r"thyroid|tsh|t3|t4"),
        (Category::Uti, r"utis?|urinary tract"),
        (Category::VaginalHealth, r"vaginal|bv|bacterial vaginosis|yeast|ph balance|ph test"),
        (Category::BreastCancerRisk, r"brca|breast cancer|genetic"),
        (
            Category::HormonePanel,
            r"hormones?|estrogen|estradiol|progesterone|testosterone|cortisol",
        ),
    ]
    .into_iter()
    .map(|(category, words)| (category, Regex::new(&format!(r"(?i)\b(?:{words})\b")).unwrap()))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceError {
    Empty,
    Invalid,
    Negative,
}

/// Parse a price string into minor units without going through floats.
///
/// Currency comes from an explicit ISO code, else a symbol, else `default_currency`.
pub fn parse_price(text: &str, default_currency: &str) -> Result<Price, PriceError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(PriceError::Empty);
    }
    if NEGATIVE.is_match(text) {
        return Err(PriceError::Negative);
    }
    let amount = AMOUNT.find(text).ok_or(PriceError::Invalid)?.as_str().replace(',', "");
    let (whole, fraction) = amount.split_once('.').unwrap_or((amount.as_str(), ""));

    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| PriceError::Invalid)?
    };
    let digits: Vec<u64> = fraction.bytes().map(|b| u64::from(b - b'0')).collect();
    let mut cents = digits.first().copied().unwrap_or(0) * 10 + digits.get(1).copied().unwrap_or(0);
    if digits.get(2).is_some_and(|d| *d >= 5) {
        cents += 1;
    }
    let cents = whole
        .checked_mul(100)
        .and_then(|w| w.checked_add(cents))
        .ok_or(PriceError::Invalid)?;

    let currency = if let Some(code) = ISO_CODE.captures(text) {
        code[1].to_string()
    } else if text.contains('€') {
        "EUR".to_string()
    } else if text.contains('£') {
        "GBP".to_string()
    } else if text.contains('$') && !matches!(default_currency, "CAD" | "AUD") {
        "USD".to_string()
    } else {
        default_currency.to_string()
    };
    Ok(Price::new(cents, currency))
}

fn fold(text: &str) -> String {
    collapse_whitespace(&text.to_lowercase())
}

/// Exact-match key for a product: folded name and brand.
pub fn match_key(name: &str, brand: &str) -> String {
    format!("{}\u{1f}{}", fold(name), fold(brand))
}

/// Brand named inside a product title, if it is one we know.
pub fn brand_from_name(name: &str) -> Option<&'static str> {
    KNOWN_BRANDS
        .iter()
        .find(|(_, pattern)| pattern.is_match(name))
        .map(|(brand, _)| *brand)
}

/// Category from keywords in the name and description, weighed against the
/// source's hint. Keywords only override a generic hint.
pub fn resolve_category(name: &str, description: Option<&str>, hint: Option<Category>) -> Category {
    let text = format!("{name} {}", description.unwrap_or_default());
    let from_keywords = CATEGORY_KEYWORDS
        .iter()
        .find(|(_, pattern)| pattern.is_match(&text))
        .map(|(category, _)| *category);
    match (from_keywords, hint) {
        (Some(found), Some(hint)) if hint.specificity() >= found.specificity() => hint,
        (Some(found), _) => found,
        (None, Some(hint)) => hint,
        (None, None) => Category::Uncategorized,
    }
}

/// Absolute http(s) URL for `candidate` relative to `page_url`.
pub fn resolve_url(page_url: &str, candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    let resolved = match Url::parse(candidate) {
        Ok(url) => url,
        Err(_) => Url::parse(page_url).ok()?.join(candidate).ok()?,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(collapse_whitespace)
        .filter(|s| !s.is_empty())
}

/// Normalize one candidate scraped from `page_url` of `source`.
pub fn normalize(
    raw: &RawRecord,
    source: &SourceConfig,
    page_url: &str,
) -> Result<NormalizedRecord, NormalizationFailure> {
    let display_name = non_blank(&raw.name).ok_or(NormalizationFailure::MissingName)?;
    let price_text = non_blank(&raw.price_text).ok_or_else(|| NormalizationFailure::MissingPrice {
        name: display_name.clone(),
    })?;
    let price = parse_price(&price_text, source.currency()).map_err(|e| match e {
        PriceError::Empty => NormalizationFailure::MissingPrice {
            name: display_name.clone(),
        },
        PriceError::Invalid => NormalizationFailure::InvalidPrice {
            name: display_name.clone(),
            raw: price_text.clone(),
        },
        PriceError::Negative => NormalizationFailure::NegativePrice {
            name: display_name.clone(),
            raw: price_text.clone(),
        },
    })?;
    let original_price = non_blank(&raw.original_price_text)
        .and_then(|text| parse_price(&text, source.currency()).ok());

    let brand = non_blank(&raw.brand)
        .or_else(|| source.brand.clone())
        .or_else(|| brand_from_name(&display_name).map(str::to_string))
        .unwrap_or_else(|| source.name.clone());
    let description = non_blank(&raw.description);
    let category = resolve_category(&display_name, description.as_deref(), source.category_hint);

    let url = raw
        .product_url
        .as_deref()
        .and_then(|u| resolve_url(page_url, u))
        .unwrap_or_else(|| page_url.to_string());
    let image_url = raw.image_url.as_deref().and_then(|u| resolve_url(page_url, u));

    Ok(NormalizedRecord {
        source: source.name.clone(),
        match_key: match_key(&display_name, &brand),
        display_name,
        brand,
        category,
        price,
        original_price,
        url,
        image_url,
        in_stock: raw.in_stock.unwrap_or(true),
        item_key: non_blank(&raw.item_key),
        description,
        tags: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceRegistry;

    #[test]
    fn test_parse_price_shapes() {
        assert_eq!(parse_price("$24.99", "USD"), Ok(Price::usd(2499)));
        assert_eq!(parse_price("24", "USD"), Ok(Price::usd(2400)));
        assert_eq!(parse_price("Now $1,299.50 was $1,499", "USD"), Ok(Price::usd(129_950)));
        assert_eq!(parse_price("$.99", "USD"), Ok(Price::usd(99)));
        assert_eq!(parse_price("19.995", "USD"), Ok(Price::usd(2000)));
        assert_eq!(parse_price("€12,50", "USD").map(|p| p.currency), Ok("EUR".to_string()));
        assert_eq!(parse_price("£7", "USD"), Ok(Price::new(700, "GBP")));
        assert_eq!(parse_price("12.05 CAD", "USD"), Ok(Price::new(1205, "CAD")));
        assert_eq!(parse_price("39.00", "EUR"), Ok(Price::new(3900, "EUR")));
    }

    #[test]
    fn test_parse_price_rejections() {
        assert_eq!(parse_price("   ", "USD"), Err(PriceError::Empty));
        assert_eq!(parse_price("See price in cart", "USD"), Err(PriceError::Invalid));
        assert_eq!(parse_price("-$5.00", "USD"), Err(PriceError::Negative));
        assert_eq!(parse_price("$ -5", "USD"), Err(PriceError::Negative));
        assert_eq!(parse_price("99999999999999999999", "USD"), Err(PriceError::Invalid));
        // a hyphen inside a word is not a sign
        assert_eq!(parse_price("Sale-$9.99", "USD"), Ok(Price::usd(999)));
    }

    #[test]
    fn test_match_key_folds_case_and_space() {
        assert_eq!(
            match_key("Clearblue  Digital Pregnancy Test", "CLEARBLUE"),
            match_key(" clearblue digital pregnancy test ", "Clearblue")
        );
        assert_ne!(match_key("Kit", "A"), match_key("Kit", "B"));
    }

    #[test]
    fn test_brand_from_name_uses_word_matches() {
        assert_eq!(brand_from_name("Easy@Home Ovulation Test Strips"), Some("Easy@Home"));
        assert_eq!(brand_from_name("first response early result"), Some("First Response"));
        assert_eq!(brand_from_name("Admiral Pregnancy Test"), None);
        assert_eq!(brand_from_name("Generic Test"), None);
    }

    #[test]
    fn test_category_resolution() {
        assert_eq!(
            resolve_category("Clearblue Early Pregnancy Test", None, Some(Category::GeneralWellness)),
            Category::Pregnancy
        );
        assert_eq!(
            resolve_category("At-home Test", Some("Checks TSH and free T4"), None),
            Category::Thyroid
        );
        // a specific hint beats keywords
        assert_eq!(
            resolve_category("Hormone Test", None, Some(Category::Pcos)),
            Category::Pcos
        );
        // word boundaries: "stick" is not "sti", "photo" is not "ph"
        assert_eq!(resolve_category("Midstream stick photo guide", None, None), Category::Uncategorized);
        assert_eq!(
            resolve_category("Wellness Kit", None, Some(Category::GeneralWellness)),
            Category::GeneralWellness
        );
    }

    #[test]
    fn test_resolve_url() {
        let page = "https://www.cvs.com/search?searchTerm=test";
        assert_eq!(
            resolve_url(page, "/shop/kit-prodid-1"),
            Some("https://www.cvs.com/shop/kit-prodid-1".to_string())
        );
        assert_eq!(
            resolve_url(page, "https://img.cvs.com/a.jpg"),
            Some("https://img.cvs.com/a.jpg".to_string())
        );
        assert_eq!(resolve_url(page, "javascript:void(0)"), None);
        assert_eq!(resolve_url(page, ""), None);
    }

    #[test]
    fn test_normalize_record() {
        let registry = SourceRegistry::builtin().unwrap();
        let cvs = registry.get("CVS").unwrap();
        let raw = RawRecord {
            name: Some("  First Response   Early Result Pregnancy Test ".to_string()),
            price_text: Some("$22.99".to_string()),
            original_price_text: Some("call".to_string()),
            product_url: Some("/shop/fr".to_string()),
            ..RawRecord::default()
        };
        let record = normalize(&raw, cvs, &cvs.category_pages[0]).unwrap();
        assert_eq!(record.display_name, "First Response Early Result Pregnancy Test");
        assert_eq!(record.brand, "First Response");
        assert_eq!(record.category, Category::Pregnancy);
        assert_eq!(record.price, Price::usd(2299));
        assert_eq!(record.original_price, None);
        assert_eq!(record.url, "https://www.cvs.com/shop/fr");
        assert!(record.in_stock);
        assert_eq!(record.source, "CVS");
    }

    #[test]
    fn test_normalize_brand_site_and_fallbacks() {
        let registry = SourceRegistry::builtin().unwrap();
        let everly = registry.get("Everlywell").unwrap();
        let raw = RawRecord {
            name: Some("Women's Health Test".to_string()),
            price_text: Some("$149".to_string()),
            ..RawRecord::default()
        };
        let record = normalize(&raw, everly, &everly.category_pages[0]).unwrap();
        assert_eq!(record.brand, "Everlywell");
        assert_eq!(record.url, everly.category_pages[0]);

        let walgreens = registry.get("Walgreens").unwrap();
        let record = normalize(&raw, walgreens, &walgreens.category_pages[0]).unwrap();
        assert_eq!(record.brand, "Walgreens");
    }

    #[test]
    fn test_normalize_failures() {
        let registry = SourceRegistry::builtin().unwrap();
        let cvs = registry.get("CVS").unwrap();
        let page = &cvs.category_pages[0];
        let no_name = RawRecord {
            price_text: Some("$1".to_string()),
            ..RawRecord::default()
        };
        assert_eq!(normalize(&no_name, cvs, page), Err(NormalizationFailure::MissingName));

        let bad_price = RawRecord {
            name: Some("Kit".to_string()),
            price_text: Some("Price unavailable".to_string()),
            ..RawRecord::default()
        };
        assert!(matches!(
            normalize(&bad_price, cvs, page),
            Err(NormalizationFailure::InvalidPrice { .. })
        ));
    }
}
