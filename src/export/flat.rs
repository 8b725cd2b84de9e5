//! Flat table: one CSV row per listing with product fields denormalized.

use super::nested::ordered_listings;
use crate::error::ExportError;
use crate::store::Catalog;
use serde::{Deserialize, Serialize};

/// Column order of the flat table. Field order of [`FlatRow`] must match.
pub const HEADER: [&str; 15] = [
    "product_id",
    "product_name",
    "brand",
    "category",
    "tags",
    "source",
    "item_key",
    "price",
    "original_price",
    "currency",
    "in_stock",
    "url",
    "image_url",
    "origin",
    "last_seen",
];

/// Columns an import cannot do without.
pub const REQUIRED: [&str; 4] = ["product_name", "source", "price", "url"];

/// Separator for the `tags` column.
pub const TAG_SEPARATOR: char = ';';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRow {
    pub product_id: u64,
    pub product_name: String,
    pub brand: String,
    pub category: String,
    pub tags: String,
    pub source: String,
    pub item_key: Option<String>,
    /// Decimal string, e.g. `24.99`.
    pub price: String,
    pub original_price: Option<String>,
    pub currency: String,
    pub in_stock: bool,
    pub url: String,
    pub image_url: Option<String>,
    pub origin: String,
    /// RFC 3339.
    pub last_seen: String,
}

pub fn build(catalog: &Catalog) -> Vec<FlatRow> {
    let mut rows = Vec::with_capacity(catalog.listing_count());
    for product in catalog.products() {
        let tags = product.tags.join(&TAG_SEPARATOR.to_string());
        for listing in ordered_listings(catalog, product) {
            rows.push(FlatRow {
                product_id: product.id,
                product_name: product.name.clone(),
                brand: product.brand.clone(),
                category: product.category.label().to_string(),
                tags: tags.clone(),
                source: listing.source.clone(),
                item_key: listing.item_key.clone(),
                price: listing.price.to_decimal(),
                original_price: listing.original_price.as_ref().map(|p| p.to_decimal()),
                currency: listing.price.currency.clone(),
                in_stock: listing.in_stock,
                url: listing.url.clone(),
                image_url: listing.image_url.clone(),
                origin: listing.origin.as_str().to_string(),
                last_seen: listing.last_seen.to_rfc3339(),
            });
        }
    }
    rows
}

/// Serialize rows with the fixed header, even when there are no rows.
pub fn to_csv(rows: &[FlatRow]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(HEADER)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| ExportError::Csv(e.into_error().into()))
}
