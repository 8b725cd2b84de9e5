//! Sample dataset for development and demos.
//!
//! The dataset is compiled in from `config/seed.yaml` and goes through the
//! reconciler like any other batch, with origin `seed`. Products already in
//! the catalog are left alone, so seeding twice is a no-op.

use crate::error::SeedError;
use crate::ledger::Ledger;
use crate::models::{Category, ListingOrigin, NormalizedRecord, RunKind, ScrapeLog, SourceOutcome, StrategyKind};
use crate::normalize::{match_key, parse_price};
use crate::reconcile::{Observation, apply_batch};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{info, instrument};

const BUILTIN_SEED: &str = include_str!("../config/seed.yaml");

#[derive(Debug, Clone, Deserialize)]
pub struct SeedListing {
    pub source: String,
    pub price: String,
    #[serde(default)]
    pub original_price: Option<String>,
    pub url: String,
    #[serde(default)]
    pub item_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedProduct {
    pub name: String,
    pub brand: String,
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub listings: Vec<SeedListing>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub products_created: usize,
    pub listings_created: usize,
    /// Products left alone because the catalog already had them.
    pub skipped: usize,
}

pub fn builtin_dataset() -> Result<Vec<SeedProduct>, SeedError> {
    serde_yaml::from_str(BUILTIN_SEED).map_err(|e| SeedError::Dataset(e.to_string()))
}

fn observations(product: &SeedProduct, now: DateTime<Utc>) -> Result<Vec<Observation>, SeedError> {
    let category = Category::from_label(&product.category);
    let key = match_key(&product.name, &product.brand);
    product
        .listings
        .iter()
        .map(|listing| {
            let price = parse_price(&listing.price, "USD")
                .map_err(|e| SeedError::Dataset(format!("{} at {}: {e:?}", product.name, listing.source)))?;
            let original_price = listing
                .original_price
                .as_deref()
                .map(|p| parse_price(p, "USD"))
                .transpose()
                .map_err(|e| SeedError::Dataset(format!("{} at {}: {e:?}", product.name, listing.source)))?;
            let record = NormalizedRecord {
                source: listing.source.clone(),
                display_name: product.name.clone(),
                brand: product.brand.clone(),
                match_key: key.clone(),
                category,
                price,
                original_price,
                url: listing.url.clone(),
                image_url: product.image_url.clone().filter(|u| !u.is_empty()),
                in_stock: true,
                item_key: listing.item_key.clone(),
                description: product.description.clone(),
                tags: product.tags.clone(),
            };
            Ok(Observation::new(record, now))
        })
        .collect()
}

/// Load the built-in dataset.
pub async fn seed(store: &Store, ledger: &Ledger) -> Result<SeedReport, SeedError> {
    seed_from(&builtin_dataset()?, store, ledger).await
}

/// Load `dataset` through the reconciler, skipping products that exist.
#[instrument(level = "info", skip_all, fields(products = dataset.len()))]
pub async fn seed_from(dataset: &[SeedProduct], store: &Store, ledger: &Ledger) -> Result<SeedReport, SeedError> {
    let started_at = Utc::now();
    let mut report = SeedReport::default();
    let mut prepared = Vec::with_capacity(dataset.len());
    for product in dataset {
        if product.listings.is_empty() {
            return Err(SeedError::Dataset(format!("product `{}` has no listings", product.name)));
        }
        prepared.push((match_key(&product.name, &product.brand), observations(product, started_at)?));
    }

    let mut batch = Vec::new();
    let applied = {
        let mut catalog = store.write().await;
        let mut queued = HashSet::new();
        for (key, product_batch) in prepared {
            if catalog.find_product(&key).is_some() || !queued.insert(key) {
                report.skipped += 1;
                continue;
            }
            batch.extend(product_batch);
        }
        apply_batch(&mut catalog, &batch, ListingOrigin::Seed)
    };
    report.products_created = applied.products_created;
    report.listings_created = applied.new;
    store.save().await?;

    let mut outcome = SourceOutcome::empty("seed", StrategyKind::None);
    outcome.found = batch.len();
    outcome.parsed = batch.len();
    outcome.products_created = applied.products_created;
    outcome.new = applied.new;
    outcome.updated = applied.updated;
    outcome.unchanged = applied.unchanged;
    outcome.conflicts = applied.conflicts.len();

    let finished_at = Utc::now();
    ledger
        .record(&ScrapeLog {
            run_id: format!("seed-{}", started_at.format("%Y%m%dT%H%M%SZ")),
            kind: RunKind::Seed,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            sources: vec![outcome],
        })
        .await;
    info!(
        products = report.products_created,
        listings = report.listings_created,
        skipped = report.skipped,
        "Seeded catalog"
    );
    Ok(report)
}
