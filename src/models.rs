//! Data models for the catalog, candidate records and run outcomes.
//!
//! This module defines the core data structures used throughout the pipeline:
//! - [`Product`] and [`Listing`]: canonical catalog entities owned by the store
//! - [`RawRecord`]: an unvalidated candidate as produced by extraction
//! - [`NormalizedRecord`]: a candidate after price, name and category cleanup
//! - [`ScrapeLog`] and [`SourceOutcome`]: the append-only run ledger entries
//!
//! Prices are held in integer minor units so that change detection and the
//! export/import round trip never depend on floating point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub type ProductId = u64;
pub type ListingId = u64;

/// The fixed set of test categories, plus the `Uncategorized` sentinel.
///
/// The serialized form is the human-readable label used in exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Pregnancy")]
    Pregnancy,
    #[serde(rename = "Ovulation & Fertility")]
    OvulationFertility,
    #[serde(rename = "STI / STD")]
    Sti,
    #[serde(rename = "Menopause & FSH")]
    Menopause,
    #[serde(rename = "Thyroid")]
    Thyroid,
    #[serde(rename = "Hormone Panel")]
    HormonePanel,
    #[serde(rename = "UTI")]
    Uti,
    #[serde(rename = "Vaginal Health")]
    VaginalHealth,
    #[serde(rename = "PCOS")]
    Pcos,
    #[serde(rename = "Breast Cancer Risk")]
    BreastCancerRisk,
    #[serde(rename = "General Wellness")]
    GeneralWellness,
    #[serde(rename = "Uncategorized")]
    Uncategorized,
}

impl Category {
    /// Every category a product may be filed under, sentinel excluded.
    pub const KNOWN: [Category; 11] = [
        Category::Pregnancy,
        Category::OvulationFertility,
        Category::Sti,
        Category::Menopause,
        Category::Thyroid,
        Category::HormonePanel,
        Category::Uti,
        Category::VaginalHealth,
        Category::Pcos,
        Category::BreastCancerRisk,
        Category::GeneralWellness,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Category::Pregnancy => "Pregnancy",
            Category::OvulationFertility => "Ovulation & Fertility",
            Category::Sti => "STI / STD",
            Category::Menopause => "Menopause & FSH",
            Category::Thyroid => "Thyroid",
            Category::HormonePanel => "Hormone Panel",
            Category::Uti => "UTI",
            Category::VaginalHealth => "Vaginal Health",
            Category::Pcos => "PCOS",
            Category::BreastCancerRisk => "Breast Cancer Risk",
            Category::GeneralWellness => "General Wellness",
            Category::Uncategorized => "Uncategorized",
        }
    }

    /// Parse a label case-insensitively. Unknown labels map to `Uncategorized`.
    pub fn from_label(label: &str) -> Category {
        let label = label.trim();
        Category::KNOWN
            .into_iter()
            .find(|c| c.label().eq_ignore_ascii_case(label))
            .unwrap_or(Category::Uncategorized)
    }

    /// How much a category says about a product. Used when a record's own
    /// keywords compete with the source's category hint.
    pub fn specificity(&self) -> u8 {
        match self {
            Category::Uncategorized => 0,
            Category::GeneralWellness => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A non-negative amount in minor units tagged with an ISO currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price {
    pub cents: u64,
    pub currency: String,
}

impl Price {
    pub fn new(cents: u64, currency: impl Into<String>) -> Self {
        Self {
            cents,
            currency: currency.into(),
        }
    }

    pub fn usd(cents: u64) -> Self {
        Self::new(cents, "USD")
    }

    /// The amount as a float, for JSON consumers.
    pub fn amount(&self) -> f64 {
        self.cents as f64 / 100.0
    }

    /// The amount as a plain decimal string, e.g. `"24.99"`.
    pub fn to_decimal(&self) -> String {
        format!("{}.{:02}", self.cents / 100, self.cents % 100)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.currency.as_str() {
            "USD" => write!(f, "${}", self.to_decimal()),
            "EUR" => write!(f, "€{}", self.to_decimal()),
            "GBP" => write!(f, "£{}", self.to_decimal()),
            other => write!(f, "{} {}", self.to_decimal(), other),
        }
    }
}

/// How a listing entered the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingOrigin {
    Scrape,
    Seed,
    Import,
}

impl ListingOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingOrigin::Scrape => "scrape",
            ListingOrigin::Seed => "seed",
            ListingOrigin::Import => "import",
        }
    }
}

/// One distinct test kit, independent of where it is sold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub brand: String,
    pub category: Category,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One source's price observation for one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub product_id: ProductId,
    pub source: String,
    #[serde(default)]
    pub item_key: Option<String>,
    pub url: String,
    pub price: Price,
    #[serde(default)]
    pub original_price: Option<Price>,
    pub in_stock: bool,
    #[serde(default)]
    pub image_url: Option<String>,
    pub origin: ListingOrigin,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Listing {
    /// Whole-percent discount against the original price, if there is one.
    pub fn discount_pct(&self) -> Option<u32> {
        let original = self.original_price.as_ref()?;
        if original.cents > self.price.cents && original.currency == self.price.currency {
            let pct = (1.0 - self.price.cents as f64 / original.cents as f64) * 100.0;
            Some(pct.round() as u32)
        } else {
            None
        }
    }
}

/// An unvalidated candidate straight out of an extraction strategy.
///
/// Model output is deserialized into this shape as well, so every field is
/// optional and accepts either strings or numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, alias = "title", deserialize_with = "lenient_text")]
    pub name: Option<String>,
    #[serde(default, alias = "price", deserialize_with = "lenient_text")]
    pub price_text: Option<String>,
    #[serde(default, alias = "original_price", deserialize_with = "lenient_text")]
    pub original_price_text: Option<String>,
    #[serde(default, alias = "url", deserialize_with = "lenient_text")]
    pub product_url: Option<String>,
    #[serde(default, alias = "image", deserialize_with = "lenient_text")]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub in_stock: Option<bool>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub item_key: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub brand: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub description: Option<String>,
}

impl RawRecord {
    /// Name and price are the minimum a candidate needs to be worth keeping.
    pub fn has_required_fields(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.name) && present(&self.price_text)
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::Number(n)) => n.as_i64().map(|n| n != 0),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "in stock" | "available" => Some(true),
            "false" | "no" | "0" | "out of stock" | "unavailable" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// A candidate with canonical fields, ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub source: String,
    /// Name as shown by the source, trimmed.
    pub display_name: String,
    pub brand: String,
    /// Folded `(name, brand)` key used for exact product matching.
    pub match_key: String,
    pub category: Category,
    pub price: Price,
    pub original_price: Option<Price>,
    pub url: String,
    pub image_url: Option<String>,
    pub in_stock: bool,
    pub item_key: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// What kind of operation produced a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Scrape,
    Seed,
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Done,
    Failed,
}

/// Why a source ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Fetch,
    Timeout,
    Extraction,
    Cancelled,
}

/// Which extraction strategy a source was run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Structural,
    ModelAssisted,
    None,
}

/// A marker that a source's extraction schema probably needs maintenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum SelectorHealth {
    /// Selectors matched nothing on a page that had content.
    ZeroResults { previously_found: Option<usize> },
}

/// Outcome of one source within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source: String,
    pub status: SourceStatus,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    pub strategy: StrategyKind,
    /// Candidates extracted.
    pub found: usize,
    /// Candidates that survived normalization.
    pub parsed: usize,
    pub products_created: usize,
    /// Listings inserted.
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Dropped candidates plus page-level failures.
    pub errors: usize,
    #[serde(default)]
    pub conflicts: usize,
    #[serde(default)]
    pub error_messages: Vec<String>,
    #[serde(default)]
    pub selector_health: Option<SelectorHealth>,
}

impl SourceOutcome {
    pub fn empty(source: impl Into<String>, strategy: StrategyKind) -> Self {
        Self {
            source: source.into(),
            status: SourceStatus::Done,
            failure: None,
            strategy,
            found: 0,
            parsed: 0,
            products_created: 0,
            new: 0,
            updated: 0,
            unchanged: 0,
            errors: 0,
            conflicts: 0,
            error_messages: Vec::new(),
            selector_health: None,
        }
    }

    pub fn failed(
        source: impl Into<String>,
        strategy: StrategyKind,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        let mut outcome = Self::empty(source, strategy);
        outcome.status = SourceStatus::Failed;
        outcome.failure = Some(kind);
        outcome.errors = 1;
        outcome.error_messages.push(message.into());
        outcome
    }
}

/// One append-only ledger entry per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeLog {
    pub run_id: String,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources: Vec<SourceOutcome>,
}

impl ScrapeLog {
    pub fn source(&self, name: &str) -> Option<&SourceOutcome> {
        self.sources.iter().find(|s| s.source == name)
    }

    /// Totals across sources, as returned to whoever triggered the run.
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            run_id: self.run_id.clone(),
            duration_ms: self.duration_ms,
            ..RunSummary::default()
        };
        for s in &self.sources {
            summary.found += s.found;
            summary.new += s.new;
            summary.updated += s.updated;
            summary.errors += s.errors;
            summary.products_created += s.products_created;
            if s.status == SourceStatus::Failed {
                summary.failed_sources.push(s.source.clone());
            }
            if s.selector_health.is_some() {
                summary.flagged_sources.push(s.source.clone());
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub duration_ms: u64,
    pub found: usize,
    pub new: usize,
    pub updated: usize,
    pub errors: usize,
    pub products_created: usize,
    pub failed_sources: Vec<String>,
    pub flagged_sources: Vec<String>,
}
