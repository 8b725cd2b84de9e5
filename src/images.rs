//! Product image backfill from retailer page metadata.
//!
//! For each product without an image, its listing pages are rendered in
//! source priority order and the first absolute `og:image`, `og:image:url`
//! or `twitter:image` value wins.

use crate::error::StoreError;
use crate::fetch::{Renderer, WaitPolicy};
use crate::models::{Listing, ProductId};
use crate::reconcile::set_product_image;
use crate::store::Store;
use chrono::Utc;
use itertools::Itertools;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// Sources whose pages carry image metadata in static HTML, best first.
const SOURCE_PRIORITY: [&str; 4] = ["amazon", "walgreens", "cvs", "target"];

const IMAGE_PROPERTIES: [&str; 3] = ["og:image", "og:image:url", "twitter:image"];

static META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta").unwrap());

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImageReport {
    pub updated: usize,
    /// Products that already had an image.
    pub skipped: usize,
    /// Products none of whose pages had usable metadata.
    pub missing: usize,
}

fn source_rank(source: &str) -> usize {
    let source = source.to_lowercase();
    SOURCE_PRIORITY
        .iter()
        .position(|s| source.contains(s))
        .unwrap_or(SOURCE_PRIORITY.len())
}

/// The first absolute image URL in the page's social metadata.
pub fn extract_meta_image(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    IMAGE_PROPERTIES.iter().find_map(|property| {
        document
            .select(&META)
            .filter(|meta| {
                let el = meta.value();
                el.attr("property") == Some(*property) || el.attr("name") == Some(*property)
            })
            .filter_map(|meta| meta.value().attr("content"))
            .map(str::trim)
            .find(|content| content.starts_with("http://") || content.starts_with("https://"))
            .map(str::to_string)
    })
}

/// Listing URLs of a product, best source first.
fn candidate_urls(listings: &[&Listing]) -> Vec<(String, String)> {
    listings
        .iter()
        .sorted_by_key(|l| (source_rank(&l.source), l.id))
        .map(|l| (l.source.clone(), l.url.clone()))
        .collect()
}

async fn find_image<R: Renderer>(renderer: &R, candidates: &[(String, String)], delay: Duration) -> Option<String> {
    let wait = WaitPolicy::default();
    for (index, (source, url)) in candidates.iter().enumerate() {
        if index > 0 {
            sleep(delay).await;
        }
        match renderer.render(url, &wait).await {
            Ok(document) => match extract_meta_image(&document.html) {
                Some(image) => {
                    debug!(%source, "Found image metadata");
                    return Some(image);
                }
                None => debug!(%source, "No image metadata on page"),
            },
            Err(e) => warn!(%source, error = %e, "Could not render listing page"),
        }
    }
    None
}

/// Fill in missing product images; with `force`, refresh every product.
#[instrument(level = "info", skip_all, fields(force = force))]
pub async fn backfill_images<R: Renderer>(
    store: &Store,
    renderer: &R,
    force: bool,
    delay: Duration,
) -> Result<ImageReport, StoreError> {
    let mut report = ImageReport::default();
    let work: Vec<(ProductId, String, Vec<(String, String)>)> = {
        let catalog = store.read().await;
        catalog
            .products()
            .filter(|p| {
                let keep = force || p.image_url.is_none();
                if !keep {
                    report.skipped += 1;
                }
                keep
            })
            .map(|p| (p.id, p.name.clone(), candidate_urls(&catalog.listings_for(p.id))))
            .collect()
    };

    for (product_id, name, candidates) in work {
        match find_image(renderer, &candidates, delay).await {
            Some(image) => {
                if set_product_image(&mut *store.write().await, product_id, &image, Utc::now()) {
                    report.updated += 1;
                    info!(product_id, %name, "Saved product image");
                }
            }
            None => {
                report.missing += 1;
                warn!(product_id, %name, "No image found");
            }
        }
    }
    if report.updated > 0 {
        store.save().await?;
    }
    info!(
        updated = report.updated,
        skipped = report.skipped,
        missing = report.missing,
        "Image backfill finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FixtureRenderer;
    use crate::ledger::Ledger;
    use crate::seed::seed;

    fn page(meta: &str) -> String {
        format!("<html><head>{meta}</head><body><h1>Kit</h1></body></html>")
    }

    #[test]
    fn test_extract_meta_image_order_and_filters() {
        let html = page(
            r#"<meta name="twitter:image" content="https://cdn.example.com/tw.jpg">
               <meta property="og:image" content="/relative.jpg">
               <meta property="og:image:url" content=" https://cdn.example.com/og.jpg ">"#,
        );
        assert_eq!(
            extract_meta_image(&html).as_deref(),
            Some("https://cdn.example.com/og.jpg")
        );
        assert_eq!(extract_meta_image(&page("")), None);
    }

    #[test]
    fn test_source_rank() {
        assert!(source_rank("Amazon") < source_rank("Walgreens"));
        assert!(source_rank("CVS Pharmacy") < source_rank("Target"));
        assert_eq!(source_rank("Everlywell"), SOURCE_PRIORITY.len());
    }

    #[tokio::test]
    async fn test_backfill_prefers_amazon_and_skips_existing() {
        let store = Store::in_memory();
        seed(&store, &Ledger::in_memory()).await.unwrap();
        // Proov's own page has an image too, but Amazon ranks first. Every
        // other product's pages are unregistered and fail to render.
        let renderer = FixtureRenderer::new()
            .with_page(
                "https://www.amazon.com/dp/B07Q74MCGR",
                page(r#"<meta property="og:image" content="https://m.media-amazon.com/proov.jpg">"#),
            )
            .with_page(
                "https://www.proovtest.com/",
                page(r#"<meta property="og:image" content="https://www.proovtest.com/og.png">"#),
            );

        let report = backfill_images(&store, &renderer, false, Duration::ZERO).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.missing, 12);

        let catalog = store.read().await;
        let proov = catalog.products().find(|p| p.brand == "Proov").unwrap();
        assert_eq!(proov.image_url.as_deref(), Some("https://m.media-amazon.com/proov.jpg"));
        drop(catalog);

        let again = backfill_images(&store, &renderer, false, Duration::ZERO).await.unwrap();
        assert_eq!((again.updated, again.skipped), (0, 1));
    }

    #[tokio::test]
    async fn test_force_refreshes_existing_images() {
        let store = Store::in_memory();
        seed(&store, &Ledger::in_memory()).await.unwrap();
        let renderer = FixtureRenderer::new().with_page(
            "https://www.amazon.com/dp/B07Q74MCGR",
            page(r#"<meta property="og:image" content="https://m.media-amazon.com/proov.jpg">"#),
        );
        backfill_images(&store, &renderer, false, Duration::ZERO).await.unwrap();

        let renderer = FixtureRenderer::new().with_page(
            "https://www.amazon.com/dp/B07Q74MCGR",
            page(r#"<meta property="og:image" content="https://m.media-amazon.com/proov-v2.jpg">"#),
        );
        let report = backfill_images(&store, &renderer, true, Duration::ZERO).await.unwrap();
        assert_eq!((report.updated, report.skipped), (1, 0));
        let catalog = store.read().await;
        let proov = catalog.products().find(|p| p.brand == "Proov").unwrap();
        assert_eq!(proov.image_url.as_deref(), Some("https://m.media-amazon.com/proov-v2.jpg"));
    }
}
