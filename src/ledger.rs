//! Append-only run ledger.
//!
//! Every scrape, seed and import appends one [`ScrapeLog`] as a JSON line.
//! Each entry is encoded up front and written with a single `write_all` on a
//! file opened in append mode, so concurrent writers never interleave lines.
//! Entries are never rewritten.

use crate::error::LedgerError;
use crate::models::{RunKind, ScrapeLog, SourceStatus};
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[derive(Debug)]
pub struct Ledger {
    path: Option<PathBuf>,
    memory: Mutex<Vec<ScrapeLog>>,
}

impl Ledger {
    /// A JSON-lines ledger at `path`, created on first append.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            memory: Mutex::new(Vec::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            memory: Mutex::new(Vec::new()),
        }
    }

    #[instrument(level = "info", skip_all, fields(run_id = %entry.run_id))]
    pub async fn append(&self, entry: &ScrapeLog) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            self.memory.lock().await.push(entry.clone());
            return Ok(());
        };
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        info!(kind = ?entry.kind, sources = entry.sources.len(), "Appended ledger entry");
        Ok(())
    }

    /// Append, logging instead of failing. The ledger never blocks a run.
    pub async fn record(&self, entry: &ScrapeLog) {
        if let Err(e) = self.append(entry).await {
            warn!(run_id = %entry.run_id, error = %e, "Could not append ledger entry");
        }
    }

    /// Every entry, oldest first. Unreadable lines are skipped with a warning.
    #[instrument(level = "debug", skip_all)]
    pub async fn entries(&self) -> Result<Vec<ScrapeLog>, LedgerError> {
        let Some(path) = &self.path else {
            return Ok(self.memory.lock().await.clone());
        };
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ScrapeLog>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = lineno + 1, error = %e, "Skipping unreadable ledger line"),
            }
        }
        Ok(entries)
    }

    /// Up to `limit` entries, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<ScrapeLog>, LedgerError> {
        let mut entries = self.entries().await?;
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    /// How many candidates `source` yielded the last time it completed a scrape.
    pub async fn last_found(&self, source: &str) -> Option<usize> {
        let entries = match self.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Could not read ledger history");
                return None;
            }
        };
        entries
            .iter()
            .rev()
            .filter(|entry| entry.kind == RunKind::Scrape)
            .filter_map(|entry| entry.source(source))
            .find(|outcome| outcome.status == SourceStatus::Done)
            .map(|outcome| outcome.found)
    }
}
