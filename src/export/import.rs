//! Import of a flat table produced by the exporter.
//!
//! Rows go through the reconciler with origin `import` and keep the
//! `last_seen` they were exported with. Rows with an unusable price are
//! skipped and counted; a header without the required columns fails the
//! whole import.

use super::flat::{REQUIRED, TAG_SEPARATOR};
use crate::error::ExportError;
use crate::ledger::Ledger;
use crate::models::{Category, ListingOrigin, NormalizedRecord, RunKind, ScrapeLog, SourceOutcome, StrategyKind};
use crate::normalize::{match_key, parse_price};
use crate::reconcile::{Observation, apply_batch};
use crate::store::Store;
use crate::utils::collapse_whitespace;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// A flat-table row as read back; every column is optional text.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImportRow {
    product_name: Option<String>,
    brand: Option<String>,
    category: Option<String>,
    tags: Option<String>,
    source: Option<String>,
    item_key: Option<String>,
    price: Option<String>,
    original_price: Option<String>,
    currency: Option<String>,
    in_stock: Option<String>,
    url: Option<String>,
    image_url: Option<String>,
    last_seen: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImportReport {
    pub rows: usize,
    pub skipped: usize,
    pub products_created: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| collapse_whitespace(&v)).filter(|v| !v.is_empty())
}

fn parse_bool(value: Option<&str>) -> bool {
    !matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("false" | "0" | "no" | "n")
    )
}

/// Turn a row into an observation, or `None` when it lacks a usable price
/// or identity.
fn to_observation(row: ImportRow, now: DateTime<Utc>) -> Option<Observation> {
    let name = non_blank(row.product_name)?;
    let source = non_blank(row.source)?;
    let url = non_blank(row.url)?;
    let currency = non_blank(row.currency).unwrap_or_else(|| "USD".to_string());
    let price = parse_price(&non_blank(row.price)?, &currency).ok()?;
    let original_price = non_blank(row.original_price).and_then(|p| parse_price(&p, &currency).ok());
    let brand = non_blank(row.brand).unwrap_or_else(|| "Unknown".to_string());
    let category = row
        .category
        .as_deref()
        .map(Category::from_label)
        .unwrap_or(Category::Uncategorized);
    let tags = row
        .tags
        .map(|t| {
            t.split(TAG_SEPARATOR)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let seen_at = row
        .last_seen
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);

    let record = NormalizedRecord {
        match_key: match_key(&name, &brand),
        display_name: name,
        brand,
        category,
        price,
        original_price,
        url,
        image_url: non_blank(row.image_url),
        in_stock: parse_bool(row.in_stock.as_deref()),
        item_key: non_blank(row.item_key),
        description: None,
        tags,
        source,
    };
    Some(Observation::new(record, seen_at))
}

/// Import a flat table from any reader.
pub async fn import_reader<R: Read>(
    reader: R,
    store: &Store,
    ledger: &Ledger,
) -> Result<ImportReport, ExportError> {
    let started_at = Utc::now();
    let mut csv_reader = csv::Reader::from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    for column in REQUIRED {
        if !headers.iter().any(|h| h.trim() == column) {
            return Err(ExportError::MissingColumn(column.to_string()));
        }
    }

    let mut report = ImportReport::default();
    let mut skipped_by_source: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_source: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    for (index, result) in csv_reader.deserialize::<ImportRow>().enumerate() {
        report.rows += 1;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!(row = index + 1, error = %e, "Skipping unreadable row");
                report.skipped += 1;
                continue;
            }
        };
        let source = row.source.clone().unwrap_or_default();
        match to_observation(row, started_at) {
            Some(observation) => by_source
                .entry(observation.record.source.clone())
                .or_default()
                .push(observation),
            None => {
                debug!(row = index + 1, "Skipping row without a usable price");
                report.skipped += 1;
                *skipped_by_source.entry(source).or_default() += 1;
            }
        }
    }

    let mut outcomes = Vec::new();
    {
        let mut catalog = store.write().await;
        for (source, observations) in &by_source {
            let batch = apply_batch(&mut catalog, observations, ListingOrigin::Import);
            report.products_created += batch.products_created;
            report.new += batch.new;
            report.updated += batch.updated;
            report.unchanged += batch.unchanged;

            let mut outcome = SourceOutcome::empty(source.clone(), StrategyKind::None);
            outcome.found = observations.len() + skipped_by_source.get(source).copied().unwrap_or(0);
            outcome.parsed = observations.len();
            outcome.products_created = batch.products_created;
            outcome.new = batch.new;
            outcome.updated = batch.updated;
            outcome.unchanged = batch.unchanged;
            outcome.errors = outcome.found - outcome.parsed;
            outcome.conflicts = batch.conflicts.len();
            outcome.error_messages = batch.conflicts.iter().map(ToString::to_string).collect();
            outcomes.push(outcome);
        }
    }
    store.save().await?;

    let finished_at = Utc::now();
    ledger
        .record(&ScrapeLog {
            run_id: format!("import-{}", started_at.format("%Y%m%dT%H%M%SZ")),
            kind: RunKind::Import,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            sources: outcomes,
        })
        .await;
    info!(
        rows = report.rows,
        skipped = report.skipped,
        new = report.new,
        updated = report.updated,
        "Import finished"
    );
    Ok(report)
}

/// Import the flat table at `path`.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn import_file(path: &Path, store: &Store, ledger: &Ledger) -> Result<ImportReport, ExportError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    import_reader(bytes.as_slice(), store, ledger).await
}
