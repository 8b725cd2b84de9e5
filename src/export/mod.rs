//! Export and import of the catalog.
//!
//! # Submodules
//!
//! - [`nested`]: products with embedded listings, written as `products.json`
//! - [`flat`]: one row per listing, written as `listings.csv`
//! - [`import`]: reads a flat table back through the reconciler
//!
//! Products are ordered by id; listings by source name, then id. Exporting
//! only takes the store's read lock.

pub mod flat;
pub mod import;
pub mod nested;

use crate::error::ExportError;
use crate::store::{Catalog, Store};
use crate::utils::ensure_writable_dir;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument};

pub use import::{ImportReport, import_file, import_reader};

pub const NESTED_FILE: &str = "products.json";
pub const FLAT_FILE: &str = "listings.csv";

/// Both export shapes, built from one consistent read of the catalog.
#[derive(Debug, Clone)]
pub struct Export {
    pub nested: Vec<nested::ProductDocument>,
    pub flat: Vec<flat::FlatRow>,
}

pub fn export(catalog: &Catalog) -> Export {
    Export {
        nested: nested::build(catalog),
        flat: flat::build(catalog),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    pub nested: PathBuf,
    pub flat: PathBuf,
}

/// Write `products.json` and `listings.csv` into `dir`, creating it if needed.
#[instrument(level = "info", skip_all, fields(dir = %dir.display()))]
pub async fn write_exports(store: &Store, dir: &Path) -> Result<ExportPaths, ExportError> {
    let Export { nested, flat } = export(&*store.read().await);
    let json = serde_json::to_vec_pretty(&nested)?;
    let csv = flat::to_csv(&flat)?;

    if let Err(source) = ensure_writable_dir(dir).await {
        error!(error = %source, "Export directory is not writable");
        return Err(ExportError::Io {
            path: dir.to_path_buf(),
            source,
        });
    }
    let paths = ExportPaths {
        nested: dir.join(NESTED_FILE),
        flat: dir.join(FLAT_FILE),
    };
    for (path, bytes) in [(&paths.nested, &json), (&paths.flat, &csv)] {
        fs::write(path, bytes).await.map_err(|source| ExportError::Io {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), bytes = bytes.len(), "Wrote export");
    }
    info!(products = nested.len(), listings = flat.len(), "Export finished");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::models::{Category, ListingOrigin, NormalizedRecord, Price, RunKind};
    use crate::normalize::match_key;
    use crate::reconcile::{Observation, apply_batch};
    use chrono::{TimeZone, Utc};

    fn record(source: &str, name: &str, brand: &str, cents: u64, url: &str) -> NormalizedRecord {
        NormalizedRecord {
            source: source.to_string(),
            display_name: name.to_string(),
            brand: brand.to_string(),
            match_key: match_key(name, brand),
            category: Category::OvulationFertility,
            price: Price::usd(cents),
            original_price: None,
            url: url.to_string(),
            image_url: None,
            in_stock: true,
            item_key: None,
            description: None,
            tags: vec!["LH".to_string(), "Digital".to_string()],
        }
    }

    async fn sample_store() -> Store {
        let store = Store::in_memory();
        let seen = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut proov = record("Target", "Proov PdG Test", "Proov", 3999, "https://www.target.com/p/proov");
        proov.original_price = Some(Price::usd(4499));
        let mut amazon = record("Amazon", "Proov PdG Test", "Proov", 3499, "https://www.amazon.com/dp/B07");
        amazon.item_key = Some("B07".to_string());
        amazon.in_stock = false;
        let observations = vec![
            Observation::new(proov, seen),
            Observation::new(amazon, seen),
            Observation::new(
                record("CVS", "Clearblue Ovulation", "Clearblue", 2699, "https://www.cvs.com/c"),
                seen,
            ),
        ];
        apply_batch(&mut *store.write().await, &observations, ListingOrigin::Seed);
        store
    }

    #[tokio::test]
    async fn test_export_orders_and_derives() {
        let store = sample_store().await;
        let Export { nested, flat } = export(&*store.read().await);

        assert_eq!(nested.len(), 2);
        assert_eq!(nested[0].name, "Proov PdG Test");
        let sources: Vec<&str> = nested[0].listings.iter().map(|l| l.source.as_str()).collect();
        assert_eq!(sources, vec!["Amazon", "Target"]);
        // Amazon is out of stock, so Target's price is the lowest available
        assert_eq!(nested[0].lowest_price, Some(39.99));
        assert_eq!(nested[0].listings[1].discount_pct, Some(11));

        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0].source, "Amazon");
        assert_eq!(flat[0].item_key.as_deref(), Some("B07"));
        assert_eq!(flat[1].price, "39.99");
        assert_eq!(flat[1].tags, "LH;Digital");
        assert_eq!(flat[2].product_id, 2);
    }

    #[tokio::test]
    async fn test_csv_header_is_fixed() {
        let csv = flat::to_csv(&[]).unwrap();
        assert_eq!(
            String::from_utf8(csv).unwrap().trim_end(),
            "product_id,product_name,brand,category,tags,source,item_key,price,original_price,currency,in_stock,url,image_url,origin,last_seen"
        );
    }

    #[tokio::test]
    async fn test_export_then_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = sample_store().await;
        let paths = write_exports(&store, &dir.path().join("out")).await.unwrap();
        assert!(paths.nested.exists());

        let fresh = Store::in_memory();
        let ledger = Ledger::in_memory();
        let report = import_file(&paths.flat, &fresh, &ledger).await.unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(report.skipped, 0);

        let before = store.read().await;
        let after = fresh.read().await;
        assert_eq!(after.product_count(), before.product_count());
        assert_eq!(after.listing_count(), before.listing_count());
        let prices = |c: &Catalog| {
            let mut p: Vec<(String, u64)> = c.listings().map(|l| (l.source.clone(), l.price.cents)).collect();
            p.sort();
            p
        };
        assert_eq!(prices(&after), prices(&before));
        let proov = after.products().find(|p| p.brand == "Proov").unwrap();
        assert_eq!(proov.tags, vec!["LH".to_string(), "Digital".to_string()]);
        assert!(after.listings().all(|l| l.origin == ListingOrigin::Import));
        assert_eq!(
            after.listings().next().unwrap().last_seen,
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
        );

        let entries = ledger.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, RunKind::Import);
    }

    #[tokio::test]
    async fn test_import_skips_bad_prices_and_defaults_fields() {
        let csv = "product_name,brand,category,source,price,url\n\
                   Wisp UTI Test,,Dental,Wisp,$12.00,https://hellowisp.com/uti\n\
                   Broken Kit,Acme,UTI,Wisp,free,https://hellowisp.com/broken\n";
        let store = Store::in_memory();
        let ledger = Ledger::in_memory();
        let report = import_reader(csv.as_bytes(), &store, &ledger).await.unwrap();
        assert_eq!((report.rows, report.skipped, report.new), (2, 1, 1));
        let catalog = store.read().await;
        let product = catalog.products().next().unwrap();
        assert_eq!(product.brand, "Unknown");
        assert_eq!(product.category, Category::Uncategorized);
    }

    #[tokio::test]
    async fn test_import_requires_columns() {
        let store = Store::in_memory();
        let ledger = Ledger::in_memory();
        let err = import_reader("product_name,source,url\nKit,CVS,https://x\n".as_bytes(), &store, &ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::MissingColumn(ref c) if c == "price"));
    }

    #[tokio::test]
    async fn test_unreadable_import_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = import_file(&dir.path().join("missing.csv"), &Store::in_memory(), &Ledger::in_memory())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Io { .. }));
    }

    #[tokio::test]
    async fn test_unwritable_export_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a-file");
        std::fs::write(&file, b"x").unwrap();
        let err = write_exports(&Store::in_memory(), &file).await.unwrap_err();
        assert!(matches!(err, ExportError::Io { .. }));
    }
}
