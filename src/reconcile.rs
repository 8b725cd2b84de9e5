//! Reconciliation and upsert: the only code that writes the catalog.
//!
//! A normalized candidate is matched to a product by its exact folded
//! `(name, brand)` key, creating the product when there is none, and then
//! upserted as a listing under `(product, source, item key or URL)`.
//!
//! Batches carry one source's observations. Within a batch, candidates that
//! land on the same listing key are deduplicated when identical; when they
//! differ the first one wins and the rest are reported as conflicts.

use crate::error::ReconciliationConflict;
use crate::models::{Category, ListingOrigin, NormalizedRecord, Price, ProductId};
use crate::store::{Catalog, ListingKey, NewListing, NewProduct};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductMatch {
    Created,
    Matched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// One candidate and when it was observed.
#[derive(Debug, Clone)]
pub struct Observation {
    pub record: NormalizedRecord,
    pub seen_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(record: NormalizedRecord, seen_at: DateTime<Utc>) -> Self {
        Self { record, seen_at }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub products_created: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Identical repeats dropped within the batch.
    pub duplicates: usize,
    pub conflicts: Vec<ReconciliationConflict>,
}

/// Find or create the product for `record`.
///
/// On a match, a missing description, image, tag list or category on the
/// product is filled in from the record.
pub fn reconcile(
    catalog: &mut Catalog,
    record: &NormalizedRecord,
    now: DateTime<Utc>,
) -> (ProductId, ProductMatch) {
    let Some(id) = catalog.find_product(&record.match_key).map(|p| p.id) else {
        let id = catalog.insert_product(
            NewProduct {
                name: record.display_name.clone(),
                brand: record.brand.clone(),
                category: record.category,
                description: record.description.clone(),
                image_url: record.image_url.clone(),
                tags: record.tags.clone(),
            },
            now,
        );
        debug!(product_id = id, name = %record.display_name, brand = %record.brand, "Created product");
        return (id, ProductMatch::Created);
    };

    if let Some(product) = catalog.product_mut(id) {
        let mut touched = false;
        if product.description.is_none() && record.description.is_some() {
            product.description = record.description.clone();
            touched = true;
        }
        if product.image_url.is_none() && record.image_url.is_some() {
            product.image_url = record.image_url.clone();
            touched = true;
        }
        if product.tags.is_empty() && !record.tags.is_empty() {
            product.tags = record.tags.clone();
            touched = true;
        }
        if product.category == Category::Uncategorized && record.category != Category::Uncategorized {
            product.category = record.category;
            touched = true;
        }
        if touched {
            product.updated_at = now;
        }
    }
    (id, ProductMatch::Matched)
}

/// Insert or refresh the listing for `record` under `product_id`.
///
/// An existing listing counts as `Updated` only when its price or
/// availability changed; everything else is refreshed silently.
pub fn upsert_listing(
    catalog: &mut Catalog,
    product_id: ProductId,
    record: &NormalizedRecord,
    origin: ListingOrigin,
    seen_at: DateTime<Utc>,
) -> UpsertOutcome {
    let key = ListingKey::new(product_id, &record.source, record.item_key.as_deref(), &record.url);
    let Some(id) = catalog.find_listing(&key).map(|l| l.id) else {
        catalog.insert_listing(
            product_id,
            NewListing {
                source: record.source.clone(),
                item_key: record.item_key.clone(),
                url: record.url.clone(),
                price: record.price.clone(),
                original_price: record.original_price.clone(),
                in_stock: record.in_stock,
                image_url: record.image_url.clone(),
                origin,
            },
            seen_at,
        );
        return UpsertOutcome::Inserted;
    };

    let Some(listing) = catalog.listing_mut(id) else {
        return UpsertOutcome::Unchanged;
    };
    let changed = listing.price != record.price || listing.in_stock != record.in_stock;
    listing.price = record.price.clone();
    listing.original_price = record.original_price.clone();
    listing.in_stock = record.in_stock;
    listing.url = record.url.clone();
    if record.image_url.is_some() {
        listing.image_url = record.image_url.clone();
    }
    if seen_at > listing.last_seen {
        listing.last_seen = seen_at;
    }
    if changed {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Unchanged
    }
}

/// What a batch has already said about one listing key.
#[derive(PartialEq)]
struct Seen {
    price: Price,
    original_price: Option<Price>,
    in_stock: bool,
}

impl Seen {
    fn of(record: &NormalizedRecord) -> Self {
        Self {
            price: record.price.clone(),
            original_price: record.original_price.clone(),
            in_stock: record.in_stock,
        }
    }
}

/// Apply one batch of observations, in order.
pub fn apply_batch(
    catalog: &mut Catalog,
    observations: &[Observation],
    origin: ListingOrigin,
) -> BatchReport {
    let mut report = BatchReport::default();
    let mut seen: HashMap<ListingKey, Seen> = HashMap::new();

    for Observation { record, seen_at } in observations {
        let (product_id, matched) = reconcile(catalog, record, *seen_at);
        if matched == ProductMatch::Created {
            report.products_created += 1;
        }

        let key = ListingKey::new(product_id, &record.source, record.item_key.as_deref(), &record.url);
        let observed = Seen::of(record);
        if let Some(first) = seen.get(&key) {
            if *first == observed {
                report.duplicates += 1;
            } else {
                warn!(%key, "Conflicting observations for one listing in a batch; keeping the first");
                report.conflicts.push(ReconciliationConflict::DuplicateListingKey {
                    source_name: record.source.clone(),
                    key: key.to_string(),
                });
            }
            continue;
        }
        seen.insert(key, observed);

        match upsert_listing(catalog, product_id, record, origin, *seen_at) {
            UpsertOutcome::Inserted => report.new += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Unchanged => report.unchanged += 1,
        }
    }
    report
}

/// Set a product's image, as found by the image backfill.
pub fn set_product_image(
    catalog: &mut Catalog,
    product_id: ProductId,
    image_url: &str,
    now: DateTime<Utc>,
) -> bool {
    match catalog.product_mut(product_id) {
        Some(product) => {
            product.image_url = Some(image_url.to_string());
            product.updated_at = now;
            true
        }
        None => false,
    }
}
