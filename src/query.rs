//! Read-only views over the catalog and the run ledger.
//!
//! Every function takes the store's read lock once, so each result is a
//! consistent snapshot even while a run is reconciling.

use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::models::{Category, Listing, Price, Product, ProductId, ScrapeLog};
use crate::store::{Catalog, Store};
use itertools::Itertools;
use serde::Serialize;

pub const MAX_PER_PAGE: usize = 100;
pub const DEFAULT_PER_PAGE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductFilter {
    pub category: Option<Category>,
    /// Case-insensitive substring over name, brand, description and tags.
    pub q: Option<String>,
    /// 1-based.
    pub page: usize,
    pub per_page: usize,
}

impl Default for ProductFilter {
    fn default() -> Self {
        Self {
            category: None,
            q: None,
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl ProductFilter {
    fn matches(&self, product: &Product) -> bool {
        if self.category.is_some_and(|c| c != product.category) {
            return false;
        }
        let Some(q) = self.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) else {
            return true;
        };
        let q = q.to_lowercase();
        let hit = |text: &str| text.to_lowercase().contains(&q);
        hit(&product.name)
            || hit(&product.brand)
            || product.description.as_deref().is_some_and(hit)
            || product.tags.iter().any(|t| hit(t))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductSummary {
    #[serde(flatten)]
    pub product: Product,
    pub lowest_price: Option<Price>,
    pub listing_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductPage {
    pub items: Vec<ProductSummary>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductDetail {
    #[serde(flatten)]
    pub product: Product,
    /// Cheapest first.
    pub listings: Vec<Listing>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStats {
    pub category: Category,
    pub count: usize,
    pub min_price: Option<Price>,
}

fn lowest_in_stock(listings: &[&Listing]) -> Option<Price> {
    listings
        .iter()
        .filter(|l| l.in_stock)
        .map(|l| &l.price)
        .min_by_key(|p| p.cents)
        .cloned()
}

fn summarize(catalog: &Catalog, product: &Product) -> ProductSummary {
    let listings = catalog.listings_for(product.id);
    ProductSummary {
        product: product.clone(),
        lowest_price: lowest_in_stock(&listings),
        listing_count: listings.len(),
    }
}

pub async fn list_products(store: &Store, filter: &ProductFilter) -> ProductPage {
    let page = filter.page.max(1);
    let per_page = filter.per_page.clamp(1, MAX_PER_PAGE);
    let catalog = store.read().await;
    let matching: Vec<&Product> = catalog.products().filter(|p| filter.matches(p)).collect();
    let items = matching
        .iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .map(|p| summarize(&catalog, p))
        .collect();
    ProductPage {
        items,
        total: matching.len(),
        page,
        per_page,
    }
}

pub async fn get_product(store: &Store, id: ProductId) -> Option<ProductDetail> {
    let catalog = store.read().await;
    let product = catalog.product(id)?.clone();
    let listings = catalog
        .listings_for(id)
        .into_iter()
        .sorted_by_key(|l| (l.price.cents, l.id))
        .cloned()
        .collect();
    Some(ProductDetail { product, listings })
}

/// Product count and cheapest in-stock price for every category in use.
pub async fn category_stats(store: &Store) -> Vec<CategoryStats> {
    let catalog = store.read().await;
    let by_category = catalog.products().into_group_map_by(|p| p.category);
    Category::KNOWN
        .into_iter()
        .filter_map(|category| {
            let products = by_category.get(&category)?;
            let listings: Vec<&Listing> = products.iter().flat_map(|p| catalog.listings_for(p.id)).collect();
            Some(CategoryStats {
                category,
                count: products.len(),
                min_price: lowest_in_stock(&listings),
            })
        })
        .collect()
}

pub async fn recent_runs(ledger: &Ledger, limit: usize) -> Result<Vec<ScrapeLog>, LedgerError> {
    ledger.recent(limit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::seed;

    async fn seeded() -> Store {
        let store = Store::in_memory();
        seed(&store, &Ledger::in_memory()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_list_products_filters_and_pages() {
        let store = seeded().await;

        let all = list_products(&store, &ProductFilter::default()).await;
        assert_eq!(all.total, 13);
        assert_eq!(all.items.len(), 13);
        assert!(all.items.windows(2).all(|w| w[0].product.id < w[1].product.id));

        let fertility = list_products(
            &store,
            &ProductFilter {
                category: Some(Category::OvulationFertility),
                ..ProductFilter::default()
            },
        )
        .await;
        assert_eq!(fertility.total, 3);

        // matches the tag on Proov and the description on Inito
        let pdg = list_products(
            &store,
            &ProductFilter {
                q: Some("PROGESTERONE".to_string()),
                ..ProductFilter::default()
            },
        )
        .await;
        assert!(pdg.items.iter().any(|i| i.product.brand == "Proov"));
        assert!(pdg.items.iter().any(|i| i.product.brand == "Inito"));

        let second = list_products(
            &store,
            &ProductFilter {
                page: 2,
                per_page: 5,
                ..ProductFilter::default()
            },
        )
        .await;
        assert_eq!(second.items.len(), 5);
        assert_eq!(second.items[0].product.id, all.items[5].product.id);
        assert_eq!(second.total, 13);
    }

    #[tokio::test]
    async fn test_per_page_is_clamped() {
        let store = seeded().await;
        let page = list_products(
            &store,
            &ProductFilter {
                per_page: 0,
                ..ProductFilter::default()
            },
        )
        .await;
        assert_eq!((page.per_page, page.items.len()), (1, 1));

        let page = list_products(
            &store,
            &ProductFilter {
                per_page: 1000,
                page: 0,
                ..ProductFilter::default()
            },
        )
        .await;
        assert_eq!((page.per_page, page.page), (MAX_PER_PAGE, 1));
    }

    #[tokio::test]
    async fn test_get_product_orders_listings_by_price() {
        let store = seeded().await;
        let id = {
            let catalog = store.read().await;
            catalog.products().find(|p| p.brand == "AZO").unwrap().id
        };
        let detail = get_product(&store, id).await.unwrap();
        let prices: Vec<u64> = detail.listings.iter().map(|l| l.price.cents).collect();
        assert_eq!(prices, vec![697, 799, 849, 899]);
        assert!(get_product(&store, 999).await.is_none());
    }

    #[tokio::test]
    async fn test_lowest_price_skips_out_of_stock() {
        let store = seeded().await;
        let id = {
            let mut catalog = store.write().await;
            let id = catalog.products().find(|p| p.brand == "AZO").unwrap().id;
            let amazon = catalog
                .listings_for(id)
                .into_iter()
                .find(|l| l.source == "Amazon")
                .unwrap()
                .id;
            catalog.listing_mut(amazon).unwrap().in_stock = false;
            id
        };
        let page = list_products(
            &store,
            &ProductFilter {
                category: Some(Category::Uti),
                ..ProductFilter::default()
            },
        )
        .await;
        assert_eq!(page.items[0].product.id, id);
        assert_eq!(page.items[0].lowest_price, Some(Price::usd(799)));
        assert_eq!(page.items[0].listing_count, 4);
    }

    #[tokio::test]
    async fn test_category_stats() {
        let store = seeded().await;
        let stats = category_stats(&store).await;
        let pregnancy = stats.iter().find(|s| s.category == Category::Pregnancy).unwrap();
        assert_eq!(pregnancy.count, 2);
        assert_eq!(pregnancy.min_price, Some(Price::usd(1488)));
        assert!(stats.iter().all(|s| s.category != Category::BreastCancerRisk));
        assert_eq!(stats.iter().map(|s| s.count).sum::<usize>(), 13);
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first() {
        let store = Store::in_memory();
        let ledger = Ledger::in_memory();
        seed(&store, &ledger).await.unwrap();
        seed(&store, &ledger).await.unwrap();
        let runs = recent_runs(&ledger, 1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].sources[0].new, 0);
    }
}
