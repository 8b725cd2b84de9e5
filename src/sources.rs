//! Source registry: which retailers are scraped and how.
//!
//! The registry is pure configuration. A built-in set of retailers ships in
//! `config/sources.yaml` and is compiled into the binary; a YAML file with the
//! same shape can replace it at runtime. Adding a source is a new entry, never a
//! code change.
//!
//! # Schema shapes
//!
//! ```yaml
//! schema:
//!   selectors:
//!     base: .product-card            # one match per candidate
//!     fields:
//!       - { field: name, selector: .product-title }
//!       - { field: url, selector: a, kind: attribute, attribute: href }
//!       - { field: in_stock, selector: .add-to-cart, kind: exists }
//!       - { field: item_key, kind: attribute, attribute: data-sku }   # on the card itself
//! ```
//!
//! or
//!
//! ```yaml
//! schema:
//!   prompt: "Extract every test kit on this page as a JSON array ..."
//! ```

use crate::error::ConfigError;
use crate::fetch::WaitPolicy;
use crate::models::Category;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

const BUILTIN_SOURCES: &str = include_str!("../config/sources.yaml");

/// Fields a selector schema can fill on a [`crate::models::RawRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Price,
    OriginalPrice,
    Url,
    ImageUrl,
    InStock,
    ItemKey,
    Brand,
    Description,
}

/// How a field's value is read from the matched element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Whitespace-collapsed text content.
    #[default]
    Text,
    /// The value of `attribute`.
    Attribute,
    /// Whether the selector matches at all.
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: Field,
    /// Relative to the item element; absent means the item element itself.
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSchema {
    /// Selector matching one element per product card.
    pub base: String,
    pub fields: Vec<FieldSpec>,
}

impl SelectorSchema {
    pub fn field(&self, field: Field) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.field == field)
    }
}

/// Extraction recipe: exactly one of `selectors` or `prompt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSchema {
    #[serde(default)]
    pub selectors: Option<SelectorSchema>,
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Politeness class; stricter sources get longer pauses between pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitClass {
    #[default]
    Standard,
    Strict,
}

impl RateLimitClass {
    pub fn page_delay(&self, base: Duration) -> Duration {
        match self {
            RateLimitClass::Standard => base,
            RateLimitClass::Strict => base.saturating_mul(4),
        }
    }
}

/// One configured retailer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub base_url: String,
    pub category_pages: Vec<String>,
    pub schema: SourceSchema,
    #[serde(default)]
    pub category_hint: Option<Category>,
    #[serde(default)]
    pub rate_limit: RateLimitClass,
    /// Set for direct-to-consumer brand sites; every product is that brand.
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    /// Overrides the element the renderer waits for.
    #[serde(default)]
    pub wait_for: Option<String>,
}

impl SourceConfig {
    pub fn currency(&self) -> &str {
        self.currency.as_deref().unwrap_or("USD")
    }

    /// Wait for the product grid to appear, then scroll to trigger lazy loads.
    pub fn wait_policy(&self) -> WaitPolicy {
        let wait_for = self
            .wait_for
            .clone()
            .or_else(|| self.schema.selectors.as_ref().map(|s| s.base.clone()));
        WaitPolicy {
            wait_for,
            scroll_to_bottom: true,
            settle: Duration::from_secs(2),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("source with empty name".to_string());
        }
        if self.category_pages.is_empty() {
            return Err(format!("{}: no category_pages", self.name));
        }
        match (&self.schema.selectors, &self.schema.prompt) {
            (Some(_), Some(_)) => {
                return Err(format!("{}: schema has both selectors and prompt", self.name));
            }
            (None, None) => return Err(format!("{}: schema is empty", self.name)),
            _ => {}
        }
        if let Some(selectors) = &self.schema.selectors {
            for required in [Field::Name, Field::Price] {
                if selectors.field(required).is_none() {
                    return Err(format!("{}: selectors lack a {:?} field", self.name, required));
                }
            }
            for spec in &selectors.fields {
                if spec.kind == FieldKind::Attribute && spec.attribute.is_none() {
                    return Err(format!(
                        "{}: {:?} is an attribute field without `attribute`",
                        self.name, spec.field
                    ));
                }
                if spec.kind == FieldKind::Exists && spec.selector.is_none() {
                    return Err(format!(
                        "{}: {:?} is an exists field without `selector`",
                        self.name, spec.field
                    ));
                }
            }
        }
        Ok(())
    }
}

/// The validated set of sources for a run.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    /// The registry compiled into the binary.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml_str(BUILTIN_SOURCES, Path::new("config/sources.yaml"))
    }

    /// Load from `path` when given, otherwise fall back to the built-in set.
    #[instrument(level = "info")]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Self::builtin();
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_yaml_str(&text, path)?;
        info!(count = registry.sources.len(), path = %path.display(), "Loaded source registry");
        Ok(registry)
    }

    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let sources: Vec<SourceConfig> =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
                path: PathBuf::from(origin),
                source,
            })?;
        Self::new(sources)
    }

    pub fn new(sources: Vec<SourceConfig>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for source in &sources {
            source.validate().map_err(ConfigError::Registry)?;
            if !seen.insert(source.name.to_lowercase()) {
                return Err(ConfigError::Registry(format!(
                    "duplicate source name {}",
                    source.name
                )));
            }
        }
        Ok(Self { sources })
    }

    pub fn get(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Sources named in `names` (case-insensitive), or all when `names` is empty.
    pub fn select(&self, names: &[String]) -> Vec<&SourceConfig> {
        if names.is_empty() {
            return self.sources.iter().collect();
        }
        self.sources
            .iter()
            .filter(|s| names.iter().any(|n| n.eq_ignore_ascii_case(&s.name)))
            .collect()
    }
}
