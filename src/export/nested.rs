//! Nested JSON document: one object per product with its listings embedded.

use crate::models::{Listing, Product};
use crate::store::Catalog;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDocument {
    pub source: String,
    pub item_key: Option<String>,
    pub price: f64,
    pub original_price: Option<f64>,
    pub discount_pct: Option<u32>,
    pub currency: String,
    pub url: String,
    pub image_url: Option<String>,
    pub in_stock: bool,
    pub origin: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDocument {
    pub id: u64,
    pub name: String,
    pub brand: String,
    pub category: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub tags: Vec<String>,
    /// Cheapest in-stock listing, if any is in stock.
    pub lowest_price: Option<f64>,
    pub listings: Vec<ListingDocument>,
}

impl ListingDocument {
    fn from_listing(listing: &Listing) -> Self {
        Self {
            source: listing.source.clone(),
            item_key: listing.item_key.clone(),
            price: listing.price.amount(),
            original_price: listing.original_price.as_ref().map(|p| p.amount()),
            discount_pct: listing.discount_pct(),
            currency: listing.price.currency.clone(),
            url: listing.url.clone(),
            image_url: listing.image_url.clone(),
            in_stock: listing.in_stock,
            origin: listing.origin.as_str().to_string(),
            last_seen: listing.last_seen,
        }
    }
}

/// Listings ordered by source name, then id.
pub(crate) fn ordered_listings<'c>(catalog: &'c Catalog, product: &Product) -> Vec<&'c Listing> {
    catalog
        .listings_for(product.id)
        .into_iter()
        .sorted_by(|a, b| a.source.cmp(&b.source).then(a.id.cmp(&b.id)))
        .collect()
}

pub fn build(catalog: &Catalog) -> Vec<ProductDocument> {
    catalog
        .products()
        .map(|product| {
            let listings = ordered_listings(catalog, product);
            let lowest_price = listings
                .iter()
                .filter(|l| l.in_stock)
                .map(|l| l.price.cents)
                .min()
                .map(|cents| cents as f64 / 100.0);
            ProductDocument {
                id: product.id,
                name: product.name.clone(),
                brand: product.brand.clone(),
                category: product.category.label().to_string(),
                description: product.description.clone(),
                image_url: product.image_url.clone(),
                tags: product.tags.clone(),
                lowest_price,
                listings: listings.into_iter().map(ListingDocument::from_listing).collect(),
            }
        })
        .collect()
}
