//! Canonical store: products and listings with their lookup indexes.
//!
//! The [`Catalog`] is the in-memory state; [`Store`] wraps it in an async
//! `RwLock` and persists it as a JSON snapshot. Readers take the read lock for
//! one operation at a time. Only the reconciler takes the write lock.
//!
//! Snapshots are written to a temporary file and renamed into place so a crash
//! mid-write never leaves a truncated store behind.

use crate::error::StoreError;
use crate::models::{Category, Listing, ListingId, ListingOrigin, Price, Product, ProductId};
use crate::normalize::match_key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};
use url::Url;

const SNAPSHOT_VERSION: u32 = 1;

/// Query parameters that identify a click, not a product.
fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || matches!(name, "ref" | "ref_" | "gclid" | "fbclid" | "mc_cid" | "mc_eid")
}

/// A listing URL with fragment, tracking parameters and trailing slash removed.
pub fn normalize_listing_url(raw: &str) -> String {
    let raw = raw.trim();
    let Ok(mut url) = Url::parse(raw) else {
        return raw.trim_end_matches('/').to_string();
    };
    url.set_fragment(None);
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.to_string().trim_end_matches('/').to_string()
}

/// Identity of a listing: one per (product, source, item key or URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingKey {
    pub product_id: ProductId,
    pub source: String,
    pub key: String,
}

impl ListingKey {
    pub fn new(product_id: ProductId, source: &str, item_key: Option<&str>, url: &str) -> Self {
        let key = match item_key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(item_key) => format!("item:{item_key}"),
            None => format!("url:{}", normalize_listing_url(url)),
        };
        Self {
            product_id,
            source: source.trim().to_lowercase(),
            key,
        }
    }

    pub fn of(listing: &Listing) -> Self {
        Self::new(
            listing.product_id,
            &listing.source,
            listing.item_key.as_deref(),
            &listing.url,
        )
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "product {} / {} / {}", self.product_id, self.source, self.key)
    }
}

/// Fields of a product about to be created.
#[derive(Debug, Clone)]
pub(crate) struct NewProduct {
    pub name: String,
    pub brand: String,
    pub category: Category,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub tags: Vec<String>,
}

/// Fields of a listing about to be created.
#[derive(Debug, Clone)]
pub(crate) struct NewListing {
    pub source: String,
    pub item_key: Option<String>,
    pub url: String,
    pub price: Price,
    pub original_price: Option<Price>,
    pub in_stock: bool,
    pub image_url: Option<String>,
    pub origin: ListingOrigin,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    products: Vec<Product>,
    listings: Vec<Listing>,
}

/// Products, listings and the indexes reconciliation matches against.
#[derive(Debug, Default)]
pub struct Catalog {
    products: BTreeMap<ProductId, Product>,
    listings: BTreeMap<ListingId, Listing>,
    next_product_id: ProductId,
    next_listing_id: ListingId,
    by_match_key: HashMap<String, ProductId>,
    by_listing_key: HashMap<ListingKey, ListingId>,
    by_product: HashMap<ProductId, Vec<ListingId>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            next_product_id: 1,
            next_listing_id: 1,
            ..Self::default()
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Result<Self, StoreError> {
        let mut catalog = Catalog::new();
        for product in snapshot.products {
            let key = match_key(&product.name, &product.brand);
            if catalog.products.contains_key(&product.id) {
                return Err(StoreError::Corrupt(format!("duplicate product id {}", product.id)));
            }
            if catalog.by_match_key.insert(key, product.id).is_some() {
                return Err(StoreError::Corrupt(format!(
                    "duplicate product `{}` by {}",
                    product.name, product.brand
                )));
            }
            catalog.next_product_id = catalog.next_product_id.max(product.id + 1);
            catalog.products.insert(product.id, product);
        }
        for listing in snapshot.listings {
            if !catalog.products.contains_key(&listing.product_id) {
                return Err(StoreError::Corrupt(format!(
                    "listing {} points at missing product {}",
                    listing.id, listing.product_id
                )));
            }
            if catalog.listings.contains_key(&listing.id) {
                return Err(StoreError::Corrupt(format!("duplicate listing id {}", listing.id)));
            }
            let key = ListingKey::of(&listing);
            if catalog.by_listing_key.insert(key.clone(), listing.id).is_some() {
                return Err(StoreError::Corrupt(format!("duplicate listing key {key}")));
            }
            catalog.by_product.entry(listing.product_id).or_default().push(listing.id);
            catalog.next_listing_id = catalog.next_listing_id.max(listing.id + 1);
            catalog.listings.insert(listing.id, listing);
        }
        Ok(catalog)
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            products: self.products.values().cloned().collect(),
            listings: self.listings.values().cloned().collect(),
        }
    }

    /// All products, id ascending.
    pub fn products(&self) -> impl Iterator<Item = &Product> {
        self.products.values()
    }

    /// All listings, id ascending.
    pub fn listings(&self) -> impl Iterator<Item = &Listing> {
        self.listings.values()
    }

    pub fn product(&self, id: ProductId) -> Option<&Product> {
        self.products.get(&id)
    }

    pub fn listings_for(&self, product_id: ProductId) -> Vec<&Listing> {
        self.by_product
            .get(&product_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.listings.get(id))
            .collect()
    }

    pub fn find_product(&self, match_key: &str) -> Option<&Product> {
        self.by_match_key.get(match_key).and_then(|id| self.products.get(id))
    }

    pub fn find_listing(&self, key: &ListingKey) -> Option<&Listing> {
        self.by_listing_key.get(key).and_then(|id| self.listings.get(id))
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }

    pub fn listing_count(&self) -> usize {
        self.listings.len()
    }

    pub(crate) fn insert_product(&mut self, new: NewProduct, now: DateTime<Utc>) -> ProductId {
        let id = self.next_product_id;
        self.next_product_id += 1;
        self.by_match_key.insert(match_key(&new.name, &new.brand), id);
        self.products.insert(
            id,
            Product {
                id,
                name: new.name,
                brand: new.brand,
                category: new.category,
                description: new.description,
                image_url: new.image_url,
                tags: new.tags,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub(crate) fn product_mut(&mut self, id: ProductId) -> Option<&mut Product> {
        self.products.get_mut(&id)
    }

    pub(crate) fn insert_listing(
        &mut self,
        product_id: ProductId,
        new: NewListing,
        seen_at: DateTime<Utc>,
    ) -> ListingId {
        let id = self.next_listing_id;
        self.next_listing_id += 1;
        let listing = Listing {
            id,
            product_id,
            source: new.source,
            item_key: new.item_key,
            url: new.url,
            price: new.price,
            original_price: new.original_price,
            in_stock: new.in_stock,
            image_url: new.image_url,
            origin: new.origin,
            first_seen: seen_at,
            last_seen: seen_at,
        };
        self.by_listing_key.insert(ListingKey::of(&listing), id);
        self.by_product.entry(product_id).or_default().push(id);
        self.listings.insert(id, listing);
        id
    }

    /// Mutable access to a listing. Its key fields (product, source, item key)
    /// must not change; the URL may, since lookups go through the stored key.
    pub(crate) fn listing_mut(&mut self, id: ListingId) -> Option<&mut Listing> {
        self.listings.get_mut(&id)
    }
}

/// The catalog behind a lock, optionally backed by a snapshot file.
#[derive(Debug)]
pub struct Store {
    path: Option<PathBuf>,
    catalog: RwLock<Catalog>,
}

impl Store {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            catalog: RwLock::new(Catalog::new()),
        }
    }

    /// Open the snapshot at `path`; a missing file is an empty store.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let catalog = match fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "unsupported snapshot version {}",
                        snapshot.version
                    )));
                }
                Catalog::from_snapshot(snapshot)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot yet; starting with an empty store");
                Catalog::new()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        info!(
            products = catalog.product_count(),
            listings = catalog.listing_count(),
            "Opened store"
        );
        Ok(Self {
            path: Some(path),
            catalog: RwLock::new(catalog),
        })
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().await
    }

    /// Persist the current catalog. A no-op for in-memory stores.
    #[instrument(level = "info", skip_all)]
    pub async fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = {
            let catalog = self.catalog.read().await;
            serde_json::to_vec_pretty(&catalog.to_snapshot())?
        };
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await.map_err(io_err)?;
        fs::rename(&tmp, path).await.map_err(io_err)?;
        debug!(bytes = bytes.len(), path = %path.display(), "Saved store snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_product(name: &str, brand: &str) -> NewProduct {
        NewProduct {
            name: name.to_string(),
            brand: brand.to_string(),
            category: Category::Pregnancy,
            description: None,
            image_url: None,
            tags: vec![],
        }
    }

    fn new_listing(source: &str, url: &str) -> NewListing {
        NewListing {
            source: source.to_string(),
            item_key: None,
            url: url.to_string(),
            price: Price::usd(1299),
            original_price: None,
            in_stock: true,
            image_url: None,
            origin: ListingOrigin::Scrape,
        }
    }

    #[test]
    fn test_normalize_listing_url() {
        assert_eq!(
            normalize_listing_url("https://www.cvs.com/shop/kit/?utm_source=x&skuId=42#reviews"),
            "https://www.cvs.com/shop/kit/?skuId=42"
        );
        assert_eq!(
            normalize_listing_url("https://www.cvs.com/shop/kit/?utm_source=x&ref=nav"),
            "https://www.cvs.com/shop/kit"
        );
        assert_eq!(normalize_listing_url(" not a url/ "), "not a url");
    }

    #[test]
    fn test_listing_key_prefers_item_key() {
        let a = ListingKey::new(1, "Amazon", Some("B0C1"), "https://www.amazon.com/dp/B0C1?ref=sr_1");
        let b = ListingKey::new(1, "amazon", Some("B0C1"), "https://www.amazon.com/other");
        assert_eq!(a, b);
        let c = ListingKey::new(1, "CVS", None, "https://www.cvs.com/shop/kit/#top");
        let d = ListingKey::new(1, "CVS", None, "https://www.cvs.com/shop/kit");
        assert_eq!(c, d);
    }

    #[test]
    fn test_catalog_assigns_ascending_ids_and_indexes() {
        let now = Utc::now();
        let mut catalog = Catalog::new();
        let p1 = catalog.insert_product(new_product("Clearblue Digital", "Clearblue"), now);
        let p2 = catalog.insert_product(new_product("Proov PdG", "Proov"), now);
        assert_eq!((p1, p2), (1, 2));
        assert_eq!(catalog.find_product(&match_key("clearblue  digital", "CLEARBLUE")).map(|p| p.id), Some(1));

        let l1 = catalog.insert_listing(p1, new_listing("CVS", "https://www.cvs.com/a"), now);
        let key = ListingKey::new(p1, "cvs", None, "https://www.cvs.com/a/");
        assert_eq!(catalog.find_listing(&key).map(|l| l.id), Some(l1));
        assert_eq!(catalog.listings_for(p1).len(), 1);
        assert!(catalog.listings_for(p2).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/store.json");
        let store = Store::open(&path).await.unwrap();
        {
            let mut catalog = store.write().await;
            let now = Utc::now();
            let p = catalog.insert_product(new_product("Kit", "Brand"), now);
            catalog.insert_listing(p, new_listing("CVS", "https://www.cvs.com/kit"), now);
        }
        store.save().await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = Store::open(&path).await.unwrap();
        let catalog = reopened.read().await;
        assert_eq!(catalog.product_count(), 1);
        assert_eq!(catalog.listing_count(), 1);
        assert_eq!(catalog.listings().next().unwrap().price, Price::usd(1299));
        drop(catalog);

        // ids continue after the highest stored id
        let mut catalog = reopened.write().await;
        let next = catalog.insert_product(new_product("Other", "Brand"), Utc::now());
        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let now = Utc::now();
        let product = |id| Product {
            id,
            name: "Kit".to_string(),
            brand: "Brand".to_string(),
            category: Category::Uti,
            description: None,
            image_url: None,
            tags: vec![],
            created_at: now,
            updated_at: now,
        };
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            products: vec![product(1), product(2)],
            listings: vec![],
        };
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();
        let err = Store::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_garbage_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(Store::open(&path).await, Err(StoreError::Serialize(_))));
    }
}
