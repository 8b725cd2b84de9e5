//! # kitprice
//!
//! A product and price ingestion pipeline for at-home health test kits. It
//! renders retailer category pages, extracts candidate products with CSS
//! selector schemas or a language model, normalizes prices, names and
//! categories, and reconciles everything into one deduplicated catalog.
//!
//! ## Usage
//!
//! ```sh
//! kitprice seed
//! kitprice scrape --source Everlywell
//! kitprice export --out-dir ./exports
//! kitprice products --category "UTI"
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetch**: render each source's category pages ([`fetch`])
//! 2. **Extract**: selectors or a completion provider produce raw candidates ([`extract`])
//! 3. **Normalize**: prices in minor units, brands, categories, URLs ([`normalize`])
//! 4. **Reconcile**: exact-match products, keyed listing upserts ([`reconcile`], [`store`])
//! 5. **Record**: one ledger line per run ([`ledger`])
//!
//! The run driver in [`pipeline`] fans sources out with bounded concurrency.
//! Export, import, seeding, queries and image backfill all go through the
//! same store and reconciler.

use clap::Parser;
use std::error::Error;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod error;
mod export;
mod extract;
mod fetch;
mod images;
mod ledger;
mod models;
mod normalize;
mod pipeline;
mod query;
mod reconcile;
mod scheduler;
mod seed;
mod sources;
mod store;
mod utils;

use cli::{Cli, Command, ScrapeArgs};
use config::Settings;
use extract::{AwfulCompletion, ExtractionMode, RetryCompletion};
use fetch::{FixtureRenderer, HttpRenderer, Renderer, RetryRenderer};
use ledger::Ledger;
use models::{Category, ScrapeLog};
use pipeline::Pipeline;
use sources::SourceRegistry;
use store::Store;

type Provider = RetryCompletion<AwfulCompletion>;

/// Everything a command needs, opened once per invocation.
struct App {
    settings: Settings,
    store: Store,
    ledger: Ledger,
}

impl App {
    async fn open(settings: Settings) -> Result<Self, Box<dyn Error>> {
        let store = Store::open(settings.store_path()).await?;
        let ledger = Ledger::at(settings.ledger_path());
        Ok(Self {
            settings,
            store,
            ledger,
        })
    }

    fn http_renderer(&self) -> Result<RetryRenderer<HttpRenderer>, Box<dyn Error>> {
        let http = HttpRenderer::new(
            &self.settings.user_agent,
            self.settings.fetch_timeout(),
            self.settings.render_service.clone(),
        )?;
        Ok(RetryRenderer::new(
            http,
            self.settings.retries,
            self.settings.retry_base_delay(),
        ))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Load the completion provider when some selected source will need it.
async fn load_provider(settings: &Settings, registry: &SourceRegistry, args: &ScrapeArgs) -> Option<Provider> {
    let needs_model = args.model
        || registry
            .select(&args.sources)
            .iter()
            .any(|s| s.schema.selectors.is_none());
    if !needs_model {
        return None;
    }
    match AwfulCompletion::load(&settings.llm_template).await {
        Ok(provider) => Some(RetryCompletion::new(
            provider,
            settings.retries,
            settings.retry_base_delay(),
        )),
        Err(e) => {
            warn!(error = %e, "No completion provider; model-assisted sources will fail");
            None
        }
    }
}

async fn run_pipeline<R: Renderer>(
    app: &App,
    registry: &SourceRegistry,
    renderer: &R,
    provider: Option<&Provider>,
    args: &ScrapeArgs,
) -> Result<ScrapeLog, Box<dyn Error>> {
    let mode = if args.model {
        ExtractionMode::Model
    } else {
        ExtractionMode::Auto
    };
    let pipeline = Pipeline::new(
        registry,
        renderer,
        provider,
        &app.store,
        &app.ledger,
        app.settings.to_pipeline_config(),
    );
    Ok(pipeline.scrape(mode, &args.sources).await?)
}

#[instrument(level = "info", skip_all, fields(model = args.model))]
async fn scrape(app: &App, args: &ScrapeArgs) -> Result<ScrapeLog, Box<dyn Error>> {
    let registry = SourceRegistry::load(app.settings.sources_file.as_deref())?;
    let provider = load_provider(&app.settings, &registry, args).await;
    let log = match &args.fixtures {
        Some(dir) => {
            let renderer = FixtureRenderer::from_dir(dir);
            run_pipeline(app, &registry, &renderer, provider.as_ref(), args).await?
        }
        None => {
            let renderer = app.http_renderer()?;
            run_pipeline(app, &registry, &renderer, provider.as_ref(), args).await?
        }
    };
    let summary = log.summary();
    info!(
        run_id = %summary.run_id,
        found = summary.found,
        new = summary.new,
        updated = summary.updated,
        errors = summary.errors,
        failed = ?summary.failed_sources,
        flagged = ?summary.flagged_sources,
        "Scrape finished"
    );
    Ok(log)
}

fn parse_category(label: &str) -> Result<Category, Box<dyn Error>> {
    match Category::from_label(label) {
        Category::Uncategorized if !label.trim().eq_ignore_ascii_case("uncategorized") => {
            Err(format!("unknown category `{label}`").into())
        }
        category => Ok(category),
    }
}

async fn dispatch(app: &App, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Seed => {
            let report = seed::seed(&app.store, &app.ledger).await?;
            println!(
                "Seeded {} products, {} listings ({} already present)",
                report.products_created, report.listings_created, report.skipped
            );
        }
        Command::Scrape(args) => {
            let log = scrape(app, &args).await?;
            print_json(&log.summary())?;
        }
        Command::Export { out_dir } => {
            let dir = out_dir.unwrap_or_else(|| app.settings.export_dir());
            let paths = export::write_exports(&app.store, &dir).await?;
            println!("{}\n{}", paths.nested.display(), paths.flat.display());
        }
        Command::Import { file } => {
            let file = file.unwrap_or_else(|| app.settings.export_dir().join(export::FLAT_FILE));
            let report = export::import_file(&file, &app.store, &app.ledger).await?;
            println!(
                "Imported {} rows: {} new, {} updated, {} unchanged, {} skipped",
                report.rows, report.new, report.updated, report.unchanged, report.skipped
            );
        }
        Command::Products {
            category,
            q,
            page,
            per_page,
        } => {
            let filter = query::ProductFilter {
                category: category.as_deref().map(parse_category).transpose()?,
                q,
                page,
                per_page,
            };
            print_json(&query::list_products(&app.store, &filter).await)?;
        }
        Command::Product { id } => match query::get_product(&app.store, id).await {
            Some(detail) => print_json(&detail)?,
            None => return Err(format!("no product with id {id}").into()),
        },
        Command::Categories => print_json(&query::category_stats(&app.store).await)?,
        Command::Runs { limit } => print_json(&query::recent_runs(&app.ledger, limit).await?)?,
        Command::FetchImages { force } => {
            let renderer = app.http_renderer()?;
            let report = images::backfill_images(&app.store, &renderer, force, app.settings.image_delay()).await?;
            println!(
                "Images: {} updated, {} skipped, {} not found",
                report.updated, report.skipped, report.missing
            );
        }
        Command::Watch {
            interval_hours,
            scrape: args,
        } => {
            let interval = interval_hours
                .map(|h| Duration::from_secs(h.max(1) * 3600))
                .unwrap_or_else(|| app.settings.refresh_interval());
            info!(interval_secs = interval.as_secs(), "Watching; Ctrl-C to stop");
            let args = &args;
            let runs = scheduler::run_every(interval, Duration::ZERO, move || async move {
                if let Err(e) = scrape(app, args).await {
                    error!(error = %e, "Scheduled scrape failed");
                }
            })
            .await;
            info!(runs, "Watch stopped");
        }
    }
    Ok(())
}

fn apply_overrides(settings: &mut Settings, args: &Cli) {
    if let Some(dir) = &args.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Some(path) = &args.sources_file {
        settings.sources_file = Some(path.clone());
    }
    if let Some(service) = &args.render_service {
        settings.render_service = Some(service.clone());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    let mut settings = Settings::load(args.config.as_deref())?;
    apply_overrides(&mut settings, &args);
    if let Err(e) = utils::ensure_writable_dir(&settings.data_dir).await {
        error!(
            path = %settings.data_dir.display(),
            error = %e,
            "Data directory is not writable (fix perms or choose a different path)"
        );
        return Err(e.into());
    }

    let app = App::open(settings).await?;
    let result = dispatch(&app, args.command).await;
    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }

    let elapsed = start_time.elapsed();
    info!(?elapsed, secs = elapsed.as_secs(), millis = elapsed.subsec_millis(), "Execution complete");
    result
}
