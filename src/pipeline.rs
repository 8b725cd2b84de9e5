//! Run driver: fetch, extract, normalize and reconcile every selected source.
//!
//! # Flow
//!
//! 1. Sources are fanned out with `buffer_unordered(max_concurrent_fetches)`.
//!    Each source renders its category pages one after another, pausing
//!    between pages according to its rate-limit class.
//! 2. Each source's fetch and extract work runs under `source_timeout`.
//! 3. As soon as a source's batch is ready, it is reconciled into the store
//!    under the write lock, one batch at a time.
//! 4. With a `run_timeout`, sources still pending at the deadline are reported
//!    `Failed` (cancelled); batches already reconciled stay.
//! 5. The store is saved (the only run-fatal step) and the run is appended to
//!    the ledger.
//!
//! Per-source progress is tracked in a [`RunContext`] and moves through
//! [`SourceState`]; invalid transitions are rejected and logged.

use crate::error::{FetchError, PipelineError};
use crate::extract::{CompletionProvider, ExtractionMode, Strategy, has_content, selector_health};
use crate::fetch::Renderer;
use crate::ledger::Ledger;
use crate::models::{FailureKind, ListingOrigin, RunKind, ScrapeLog, SourceOutcome, SourceStatus, StrategyKind};
use crate::normalize::normalize;
use crate::reconcile::{Observation, apply_batch};
use crate::sources::{SourceConfig, SourceRegistry};
use crate::store::Store;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::{Rng, rng};
use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_concurrent_fetches: usize,
    pub source_timeout: Duration,
    pub run_timeout: Option<Duration>,
    /// Pause between category pages of a standard source.
    pub page_delay: Duration,
    /// Visible-text budget for model-assisted extraction.
    pub max_prompt_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            source_timeout: Duration::from_secs(120),
            run_timeout: None,
            page_delay: Duration::from_millis(500),
            max_prompt_chars: 12_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Pending,
    Fetching,
    Extracting,
    Reconciling,
    Done,
    Failed,
}

impl SourceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SourceState::Done | SourceState::Failed)
    }

    pub fn can_transition_to(self, next: SourceState) -> bool {
        use SourceState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed)
                | (Pending, Fetching)
                | (Fetching, Fetching)
                | (Fetching, Extracting)
                // an earlier page was extracted, the last one failed to render
                | (Fetching, Reconciling)
                | (Extracting, Fetching)
                | (Extracting, Reconciling)
                | (Reconciling, Done)
        )
    }
}

/// Per-run state: identity, deadline and each source's progress.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub mode: ExtractionMode,
    deadline: Option<Instant>,
    state: Mutex<RunState>,
    progress: Mutex<HashMap<String, SourceState>>,
}

impl RunContext {
    pub fn new<'s>(
        mode: ExtractionMode,
        run_timeout: Option<Duration>,
        sources: impl IntoIterator<Item = &'s str>,
    ) -> Self {
        let started_at = Utc::now();
        let suffix: u32 = rng().random_range(0..0x100_0000);
        Self {
            run_id: format!("{}-{suffix:06x}", started_at.format("%Y%m%dT%H%M%SZ")),
            started_at,
            mode,
            deadline: run_timeout.map(|t| Instant::now() + t),
            state: Mutex::new(RunState::Idle),
            progress: Mutex::new(
                sources
                    .into_iter()
                    .map(|name| (name.to_string(), SourceState::Pending))
                    .collect(),
            ),
        }
    }

    pub fn run_state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_run_state(&self, next: RunState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn source_state(&self, source: &str) -> Option<SourceState> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
            .copied()
    }

    /// Move `source` to `next`. Returns false (and logs) when the move is invalid.
    pub fn transition(&self, source: &str, next: SourceState) -> bool {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = progress.get_mut(source) else {
            warn!(source, ?next, "Transition for a source outside this run");
            return false;
        };
        if !current.can_transition_to(next) {
            warn!(source, from = ?*current, to = ?next, "Rejected invalid source transition");
            return false;
        }
        debug!(source, from = ?*current, to = ?next, "Source transition");
        *current = next;
        true
    }

    /// Sources that have not reached `Done` or `Failed`.
    pub fn unfinished(&self) -> Vec<String> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, state)| !state.is_terminal())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// One source's extraction result, before reconciliation.
struct SourceBatch<'a> {
    source: &'a SourceConfig,
    outcome: SourceOutcome,
    observations: Vec<Observation>,
}

pub struct Pipeline<'a, R, P> {
    registry: &'a SourceRegistry,
    renderer: &'a R,
    provider: Option<&'a P>,
    store: &'a Store,
    ledger: &'a Ledger,
    config: PipelineConfig,
}

impl<'a, R, P> Pipeline<'a, R, P>
where
    R: Renderer,
    P: CompletionProvider,
{
    pub fn new(
        registry: &'a SourceRegistry,
        renderer: &'a R,
        provider: Option<&'a P>,
        store: &'a Store,
        ledger: &'a Ledger,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            renderer,
            provider,
            store,
            ledger,
            config,
        }
    }

    /// Run every source named in `names` (all when empty).
    #[instrument(level = "info", skip_all, fields(mode = ?mode, sources = ?names))]
    pub async fn scrape(&self, mode: ExtractionMode, names: &[String]) -> Result<ScrapeLog, PipelineError> {
        let sources = self.registry.select(names);
        if sources.is_empty() && !names.is_empty() {
            return Err(PipelineError::NoSources(names.to_vec()));
        }
        let ctx = RunContext::new(mode, self.config.run_timeout, sources.iter().map(|s| s.name.as_str()));
        ctx.set_run_state(RunState::Running);
        info!(run_id = %ctx.run_id, count = sources.len(), "Starting scrape run");

        let mut outcomes = Vec::with_capacity(sources.len());
        let mut timed_out = false;
        {
            let mut batches = pin!(
                stream::iter(sources.iter().copied())
                    .map(|source| self.run_source(&ctx, source))
                    .buffer_unordered(self.config.max_concurrent_fetches.max(1))
            );
            loop {
                let next = match ctx.deadline {
                    Some(deadline) => match timeout_at(deadline, batches.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            timed_out = true;
                            break;
                        }
                    },
                    None => batches.next().await,
                };
                let Some(batch) = next else {
                    break;
                };
                outcomes.push(self.reconcile_batch(&ctx, batch).await);
            }
        }

        if timed_out {
            let unfinished = ctx.unfinished();
            warn!(pending = ?unfinished, "Run timed out; cancelling pending sources");
            for name in unfinished {
                if outcomes.iter().any(|o: &SourceOutcome| o.source == name) {
                    continue;
                }
                ctx.transition(&name, SourceState::Failed);
                let strategy = self
                    .registry
                    .get(&name)
                    .map(|s| Strategy::select(s, mode, self.provider, 0).kind())
                    .unwrap_or(StrategyKind::None);
                outcomes.push(SourceOutcome::failed(
                    name,
                    strategy,
                    FailureKind::Cancelled,
                    "run timed out before the source finished",
                ));
            }
        }

        let order: HashMap<&str, usize> = sources.iter().enumerate().map(|(i, s)| (s.name.as_str(), i)).collect();
        outcomes.sort_by_key(|o| order.get(o.source.as_str()).copied().unwrap_or(usize::MAX));

        if let Err(e) = self.store.save().await {
            error!(error = %e, "Could not save store; aborting run");
            return Err(e.into());
        }

        ctx.set_run_state(RunState::Completed);
        let finished_at = Utc::now();
        let log = ScrapeLog {
            run_id: ctx.run_id.clone(),
            kind: RunKind::Scrape,
            started_at: ctx.started_at,
            finished_at,
            duration_ms: (finished_at - ctx.started_at).num_milliseconds().max(0) as u64,
            sources: outcomes,
        };
        self.ledger.record(&log).await;

        let summary = log.summary();
        info!(
            run_id = %summary.run_id,
            duration_ms = summary.duration_ms,
            found = summary.found,
            new = summary.new,
            updated = summary.updated,
            errors = summary.errors,
            failed = ?summary.failed_sources,
            flagged = ?summary.flagged_sources,
            "Scrape run completed"
        );
        Ok(log)
    }

    async fn reconcile_batch(&self, ctx: &RunContext, batch: SourceBatch<'_>) -> SourceOutcome {
        let SourceBatch {
            source,
            mut outcome,
            observations,
        } = batch;
        if outcome.status == SourceStatus::Failed {
            return outcome;
        }
        ctx.transition(&source.name, SourceState::Reconciling);
        let report = {
            let mut catalog = self.store.write().await;
            apply_batch(&mut catalog, &observations, ListingOrigin::Scrape)
        };
        outcome.products_created = report.products_created;
        outcome.new = report.new;
        outcome.updated = report.updated;
        outcome.unchanged = report.unchanged;
        outcome.conflicts = report.conflicts.len();
        outcome
            .error_messages
            .extend(report.conflicts.iter().map(ToString::to_string));
        ctx.transition(&source.name, SourceState::Done);
        info!(
            source = %source.name,
            found = outcome.found,
            parsed = outcome.parsed,
            new = outcome.new,
            updated = outcome.updated,
            errors = outcome.errors,
            conflicts = outcome.conflicts,
            "Source reconciled"
        );
        outcome
    }

    async fn run_source<'s>(&self, ctx: &RunContext, source: &'s SourceConfig) -> SourceBatch<'s> {
        let strategy = Strategy::select(source, ctx.mode, self.provider, self.config.max_prompt_chars);
        let kind = strategy.kind();
        match timeout(self.config.source_timeout, self.collect(ctx, source, &strategy)).await {
            Ok(batch) => batch,
            Err(_) => {
                warn!(source = %source.name, timeout = ?self.config.source_timeout, "Source timed out");
                ctx.transition(&source.name, SourceState::Failed);
                SourceBatch {
                    source,
                    outcome: SourceOutcome::failed(
                        &source.name,
                        kind,
                        FailureKind::Timeout,
                        format!("source timed out after {:?}", self.config.source_timeout),
                    ),
                    observations: Vec::new(),
                }
            }
        }
    }

    #[instrument(level = "info", skip_all, fields(source = %source.name))]
    async fn collect<'s>(
        &self,
        ctx: &RunContext,
        source: &'s SourceConfig,
        strategy: &Strategy<'_, P>,
    ) -> SourceBatch<'s> {
        let wait = source.wait_policy();
        let mut outcome = SourceOutcome::empty(&source.name, strategy.kind());
        let mut observations = Vec::new();
        let mut pages_extracted = 0usize;
        let mut pages_rendered = 0usize;
        let mut fetch_errors: Vec<FetchError> = Vec::new();
        let mut saw_content = false;

        for (i, page) in source.category_pages.iter().enumerate() {
            if i > 0 {
                sleep(source.rate_limit.page_delay(self.config.page_delay)).await;
            }
            ctx.transition(&source.name, SourceState::Fetching);
            let document = match self.renderer.render(page, &wait).await {
                Ok(document) => document,
                Err(e) => {
                    warn!(%page, error = %e, "Page fetch failed");
                    outcome.errors += 1;
                    outcome.error_messages.push(e.to_string());
                    fetch_errors.push(e);
                    continue;
                }
            };
            pages_rendered += 1;
            saw_content |= has_content(&document);

            ctx.transition(&source.name, SourceState::Extracting);
            let raws = match strategy.extract(&document).await {
                Ok(raws) => raws,
                Err(e) => {
                    warn!(%page, error = %e, "Extraction failed");
                    outcome.errors += 1;
                    outcome.error_messages.push(e.to_string());
                    continue;
                }
            };
            pages_extracted += 1;
            outcome.found += raws.len();

            let seen_at = Utc::now();
            for raw in &raws {
                match normalize(raw, source, &document.url) {
                    Ok(record) => observations.push(Observation::new(record, seen_at)),
                    Err(e) => {
                        debug!(%page, error = %e, "Dropped candidate");
                        outcome.errors += 1;
                        outcome.error_messages.push(e.to_string());
                    }
                }
            }
        }
        outcome.parsed = observations.len();

        if pages_extracted == 0 {
            let kind = if pages_rendered > 0 {
                FailureKind::Extraction
            } else if !fetch_errors.is_empty() && fetch_errors.iter().all(FetchError::is_timeout) {
                FailureKind::Timeout
            } else {
                FailureKind::Fetch
            };
            warn!(?kind, errors = outcome.errors, "Source failed");
            ctx.transition(&source.name, SourceState::Failed);
            outcome.status = SourceStatus::Failed;
            outcome.failure = Some(kind);
            return SourceBatch {
                source,
                outcome,
                observations: Vec::new(),
            };
        }

        if outcome.found == 0 && strategy.kind() == StrategyKind::Structural && saw_content {
            let previously_found = self.ledger.last_found(&source.name).await;
            outcome.selector_health = selector_health(strategy.kind(), outcome.found, saw_content, previously_found);
            warn!(?previously_found, "Selectors matched nothing on a page with content");
        }

        SourceBatch {
            source,
            outcome,
            observations,
        }
    }
}
