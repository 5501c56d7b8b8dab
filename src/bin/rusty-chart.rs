//! rusty-chart CLI - headless driver for the charting core
//!
//! ## Example Usage
//!
//! ```bash
//! # Load a CSV history into the local store
//! rusty-chart import AAPL data/AAPL.csv --name "Apple Inc."
//!
//! # Chart two instruments from CSV files without touching the network
//! rusty-chart chart AAPL MSFT --offline data/
//!
//! # Saved comparisons
//! rusty-chart comparisons list
//! rusty-chart comparisons delete 3
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rusty_chart::config::ChartConfig;
use rusty_chart::data::sources::{parse_range_body, MemorySource, RemoteSource};
use rusty_chart::data::BarUnit;
use rusty_chart::orchestrator::{Frame, Notice, Orchestrator};
use rusty_chart::prelude::{Comparison, DataServices, Instrument, LocalStore};
use rusty_chart::store::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// rusty-chart: multi-instrument price charts
#[derive(Parser)]
#[command(name = "rusty-chart")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Synchronized multi-instrument price charting", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search cached instrument listings
    Search {
        #[arg(value_name = "TEXT")]
        text: String,
    },

    /// Load a comparison and print a summary per instrument
    Chart {
        #[arg(value_name = "TICKER", required = true)]
        tickers: Vec<String>,

        /// Serve prices from TICKER.csv files in this directory
        #[arg(long)]
        offline: Option<PathBuf>,

        /// First session for instruments not in the store (YYYY-MM-DD)
        #[arg(long, default_value = "2000-01-03")]
        since: String,

        /// Zoom factor applied after loading; below 1 zooms out
        #[arg(short = 'z', long)]
        zoom: Option<f64>,

        /// Save the comparison
        #[arg(short = 's', long)]
        save: bool,

        /// Seconds to wait for every instrument
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Manage saved comparisons
    Comparisons {
        #[command(subcommand)]
        action: ComparisonAction,
    },

    /// Import a CSV price history into the local store
    Import {
        #[arg(value_name = "TICKER")]
        ticker: String,

        #[arg(value_name = "CSV_FILE")]
        csv_file: PathBuf,

        /// Instrument name
        #[arg(short = 'n', long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum ComparisonAction {
    /// List saved comparisons
    List,

    /// Delete a saved comparison
    Delete {
        #[arg(value_name = "ID")]
        id: i64,
    },
}

struct ChartArgs {
    tickers: Vec<String>,
    offline: Option<PathBuf>,
    since: NaiveDate,
    zoom: Option<f64>,
    save: bool,
    timeout: Duration,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ChartConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.ensure_dirs().context("Failed to create data directory")?;

    if cli.verbose {
        println!("{} v{}", "rusty-chart".cyan().bold(), env!("CARGO_PKG_VERSION"));
        println!(
            "Database: {}",
            config.database_path().display().to_string().dimmed()
        );
    }

    let store = Arc::new(
        SqliteStore::new(&config.database_path())
            .with_context(|| format!("Failed to open {}", config.database_path().display()))?,
    );

    match cli.command {
        Commands::Search { text } => search(store.as_ref(), &text).await,
        Commands::Chart {
            tickers,
            offline,
            since,
            zoom,
            save,
            timeout,
        } => {
            let since = NaiveDate::parse_from_str(&since, "%Y-%m-%d")
                .with_context(|| format!("Invalid --since date {}", since))?;
            let args = ChartArgs {
                tickers,
                offline,
                since,
                zoom,
                save,
                timeout: Duration::from_secs(timeout),
            };
            chart(&config, store, args).await
        }
        Commands::Comparisons { action } => comparisons(store.as_ref(), action).await,
        Commands::Import {
            ticker,
            csv_file,
            name,
        } => import(store.as_ref(), &ticker, &csv_file, name).await,
    }
}

async fn search(store: &SqliteStore, text: &str) -> Result<()> {
    let found = store.search_instruments(text).await?;
    if found.is_empty() {
        println!("{}", "No matching instruments".yellow());
        return Ok(());
    }
    for listing in found {
        println!(
            "{:<8} {} {}",
            listing.ticker.bright_green().bold(),
            listing.name,
            format!("since {}", listing.start_date).dimmed()
        );
    }
    Ok(())
}

fn remote_source(config: &ChartConfig, offline: Option<PathBuf>) -> Result<Arc<dyn RemoteSource>> {
    if let Some(dir) = offline {
        let source = MemorySource::from_csv_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?;
        return Ok(Arc::new(source));
    }
    #[cfg(feature = "http")]
    {
        let source = rusty_chart::data::sources::HttpSource::new(&config.api)?;
        Ok(Arc::new(source))
    }
    #[cfg(not(feature = "http"))]
    {
        let _ = config;
        Err(anyhow!("Built without the http feature; use --offline"))
    }
}

/// Stored listing for a ticker, registering a new one when missing
async fn resolve_instrument(store: &SqliteStore, ticker: &str, since: NaiveDate) -> Result<Instrument> {
    let ticker = ticker.to_uppercase();
    let found = store.search_instruments(&ticker).await?;
    if let Some(listing) = found.into_iter().find(|l| l.ticker == ticker) {
        return Ok(listing);
    }
    let mut listing = Instrument::new(0, &ticker, &ticker, since);
    listing.stock_id = store.save_listing(&listing).await?;
    Ok(listing)
}

async fn chart(config: &ChartConfig, store: Arc<SqliteStore>, args: ChartArgs) -> Result<()> {
    let mut comparison = Comparison::new();
    for ticker in &args.tickers {
        comparison.add(resolve_instrument(&store, ticker, args.since).await?);
    }
    if args.save {
        comparison = store.save_comparison(&comparison).await?;
    }

    let services = DataServices::new(remote_source(config, args.offline)?, store.clone())
        .with_timing(config.acquisition);
    let mut orchestrator = Orchestrator::new(services, config);
    let frames = orchestrator.subscribe();
    let mut notices = orchestrator
        .take_notices()
        .ok_or_else(|| anyhow!("Notice channel already taken"))?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Loading {}", comparison.title));

    orchestrator.update_comparison(comparison).await?;
    let loaded = tokio::time::timeout(args.timeout, orchestrator.wait_until_ready()).await;

    let mut failures = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let Notice::RequestFailed { ticker, error } = notice {
            failures.push(format!("{}: {}", ticker, error));
        }
    }
    match loaded {
        Ok(result) => {
            result?;
            spinner.finish_with_message("Loaded");
        }
        Err(_) => {
            spinner.finish_with_message("Timed out");
            return Err(anyhow!("Instruments not ready after {:?}", args.timeout));
        }
    }

    if let Some(scale) = args.zoom {
        orchestrator.scale_chart(scale, 0.0).await?;
    }

    for failure in &failures {
        eprintln!("{} {}", "Warning:".yellow(), failure);
    }
    let frame = frames.borrow().clone();
    print_frame(&frame, orchestrator.unit(), orchestrator.x_factor());
    Ok(())
}

fn print_frame(frame: &Frame, unit: BarUnit, x_factor: f64) {
    println!();
    println!("{}", "Comparison Summary".green().bold());
    println!("{}", "==================".green());
    println!(
        "  {} {:?} at {:.2} px per bar",
        "Resolution:".bold(),
        unit,
        x_factor
    );
    for chart in &frame.charts {
        let change = (chart.percent_change - 1.0) * 100.0;
        let last = format!("{:.2}", chart.last_price);
        let last = if chart.up_points.len() >= chart.down_points.len() {
            last.green()
        } else {
            last.red()
        };
        println!(
            "  {:<8} last {}  range {:.2}-{:.2}  span {:.1}%  {} labels",
            chart.ticker.bright_green().bold(),
            last,
            chart.min_low,
            chart.max_high,
            change,
            chart.month_labels.len()
        );
    }
    for key in &frame.sparkline_keys {
        if let (Some(min), Some(max)) = (frame.metric_ranges.min(key), frame.metric_ranges.max(key)) {
            println!("  {:<24} {:.2} to {:.2}", key.cyan(), min, max);
        }
    }
}

async fn comparisons(store: &SqliteStore, action: ComparisonAction) -> Result<()> {
    match action {
        ComparisonAction::List => {
            let saved = store.load_comparisons().await?;
            if saved.is_empty() {
                println!("{}", "No saved comparisons".yellow());
            }
            for comparison in saved {
                println!(
                    "{:>4}  {}",
                    comparison.id.unwrap_or_default().to_string().bold(),
                    comparison.title
                );
            }
        }
        ComparisonAction::Delete { id } => {
            store.delete_comparison(id).await?;
            println!("{} Deleted comparison {}", "✓".green().bold(), id);
        }
    }
    Ok(())
}

async fn import(
    store: &SqliteStore,
    ticker: &str,
    csv_file: &Path,
    name: Option<String>,
) -> Result<()> {
    let body = std::fs::read_to_string(csv_file)
        .with_context(|| format!("Failed to read {}", csv_file.display()))?;
    let bars = parse_range_body(&body);
    let oldest = bars
        .iter()
        .map(|b| b.date)
        .min()
        .ok_or_else(|| anyhow!("No bars in {}", csv_file.display()))?;

    let ticker = ticker.to_uppercase();
    let listing = Instrument::new(0, &ticker, name.as_deref().unwrap_or(&ticker), oldest);
    let stock_id = store.save_listing(&listing).await?;
    store.save_bars(stock_id, &bars).await?;
    println!(
        "{} Imported {} bars for {}",
        "✓".green().bold(),
        bars.len(),
        ticker.bright_green()
    );
    Ok(())
}
