//! Command-line interface definitions for kitprice.
//!
//! Global options can also be provided through environment variables; they
//! override the matching keys of the settings file.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Scrape, reconcile and export at-home health test prices.
///
/// # Examples
///
/// ```sh
/// # Load the sample catalog, then refresh two sources
/// kitprice seed
/// kitprice scrape --source CVS --source Amazon
///
/// # Run against saved pages instead of the network
/// kitprice scrape --fixtures ./pages
///
/// # Refresh every 12 hours until Ctrl-C
/// kitprice watch --interval-hours 12
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to a settings YAML file
    #[arg(short, long, global = true, env = "KITPRICE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the catalog, run ledger and exports
    #[arg(short, long, global = true, env = "KITPRICE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Source registry YAML; the built-in registry is used otherwise
    #[arg(long = "sources", id = "sources_file", global = true, env = "KITPRICE_SOURCES")]
    pub sources_file: Option<PathBuf>,

    /// JavaScript rendering service endpoint
    #[arg(long, global = true, env = "KITPRICE_RENDER_SERVICE")]
    pub render_service: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Load the built-in sample catalog
    Seed,
    /// Scrape sources into the catalog
    Scrape(ScrapeArgs),
    /// Write products.json and listings.csv
    Export {
        /// Output directory (defaults to <data-dir>/exports)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
    },
    /// Import a listings.csv produced by `export`
    Import {
        /// Flat table to import (defaults to <data-dir>/exports/listings.csv)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// List products
    Products {
        #[arg(long)]
        category: Option<String>,
        /// Case-insensitive search over name, brand, description and tags
        #[arg(short, long)]
        q: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        per_page: usize,
    },
    /// Show one product with its listings, cheapest first
    Product { id: u64 },
    /// Product count and lowest price per category
    Categories,
    /// Recent runs, newest first
    Runs {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Fill in product images from listing page metadata
    FetchImages {
        /// Refresh products that already have an image
        #[arg(long)]
        force: bool,
    },
    /// Scrape on a fixed interval until Ctrl-C
    Watch {
        /// Hours between runs (defaults to the settings value)
        #[arg(long)]
        interval_hours: Option<u64>,
        #[command(flatten)]
        scrape: ScrapeArgs,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScrapeArgs {
    /// Use model-assisted extraction for every source
    #[arg(long)]
    pub model: bool,

    /// Only scrape the named source; repeatable
    #[arg(short, long = "source", value_name = "NAME")]
    pub sources: Vec<String>,

    /// Render pages from saved HTML files in this directory
    #[arg(long, value_name = "DIR")]
    pub fixtures: Option<PathBuf>,
}
