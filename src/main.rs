mod adjust;
mod config;
mod fmp;
mod loader;
mod models;
mod pipeline;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::adjust::{AdjustmentEngine, AdjustmentStatus};
use crate::config::AppConfig;
use crate::fmp::FmpClient;
use crate::loader::{discover_files, load_composition_file, load_dividend_file, load_price_file};
use crate::pipeline::Pipeline;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "fmp-etl", about = "FMP end-of-day store with dividend back-adjustment", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Apply schema migrations without loading data
    Migrate,

    /// Pull the upstream symbol list into the symbols table
    FetchSymbols,

    /// Fetch price history and dividends (default: every stored symbol)
    Fetch {
        symbols: Vec<String>,

        /// Overwrite OHLCV of stored bars; adjusted closes are kept
        #[arg(long)]
        refresh: bool,
    },

    /// Bulk-load FMP price JSON or EOD CSV files
    LoadPrices {
        #[arg(short, long, default_value = "data/prices")]
        dir: PathBuf,

        /// Overwrite OHLCV of stored bars; adjusted closes are kept
        #[arg(long)]
        refresh: bool,
    },

    /// Fetch company profiles (default: every stored symbol)
    FetchProfiles {
        symbols: Vec<String>,
    },

    /// Fetch key metrics (default: every stored symbol)
    FetchMetrics {
        symbols: Vec<String>,

        /// `quarter` or `annual` (default from config)
        #[arg(long)]
        period: Option<String>,
    },

    /// Snapshot current index membership (SP500, NASDAQ, DOWJONES)
    FetchIndex {
        index: String,
    },

    /// Bulk-load STOXX-style index composition CSV files
    LoadIndex {
        #[arg(short, long, default_value = "data/index")]
        dir: PathBuf,
    },

    /// Show the stored profile of one symbol
    Profile {
        symbol: String,
    },

    /// List the latest stored members of an index
    Members {
        index: String,

        #[arg(long)]
        json: bool,
    },

    /// Bulk-load FMP stock_dividend JSON files
    LoadDividends {
        #[arg(short, long, default_value = "data/dividends")]
        dir: PathBuf,
    },

    /// Back-adjust one instrument for a cash dividend
    Adjust {
        symbol: String,
        /// Ex-dividend date (YYYY-MM-DD)
        date: NaiveDate,
        amount: f64,
    },

    /// List price divergences with no recorded adjustment
    Undeclared {
        #[arg(long)]
        since: Option<NaiveDate>,

        #[arg(long)]
        json: bool,
    },

    /// Apply undeclared events using stored dividends
    Reconcile {
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Fall back to the implied amount when no dividend is stored
        #[arg(long)]
        accept_implied: bool,
    },

    /// Show applied adjustments
    Events {
        #[arg(short, long)]
        symbol: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print close / adjusted close for one symbol
    History {
        symbol: String,
    },

    /// Show database statistics
    Stats,

    /// List all stored symbols
    Symbols,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "fmp_etl=info,warn",
        1 => "fmp_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    let since_default = (Utc::now() - Duration::days(config.adjustment.lookback_days)).date_naive();

    match cli.command {
        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }

        Command::FetchSymbols => {
            let repo = open_repo(&config)?;
            let source = Arc::new(FmpClient::new(&config.fmp)?);
            let n = Pipeline::new(config, source).refresh_symbols(&repo).await?;
            info!("{} symbols stored", n);
        }

        Command::Fetch { symbols, refresh } => {
            let _t = utils::Timer::start("Fetch");
            let repo = open_repo(&config)?;
            let Some(symbols) = target_symbols(&repo, &symbols)? else {
                return Ok(());
            };

            let mut config = config;
            config.pipeline.refresh_bars |= refresh;
            let source = Arc::new(FmpClient::new(&config.fmp)?);
            let stats = Pipeline::new(config, source).run(&repo, &symbols).await?;
            info!(
                "Done: {} symbols, {} bars, {} refreshed, {} dividends, {} errors",
                stats.symbols_processed, stats.bars_inserted, stats.bars_refreshed,
                stats.dividends_inserted, stats.errors
            );
        }

        Command::LoadPrices { dir, refresh } => {
            let _t = utils::Timer::start("Price bulk load");
            let repo = open_repo(&config)?;
            load_dir(&dir, &["json", "csv"], |path| {
                let (_, bars) = load_price_file(path)?;
                if refresh {
                    let (inserted, updated) = repo.refresh_daily_bars(&bars)?;
                    Ok(inserted + updated)
                } else {
                    repo.insert_daily_bars(&bars)
                }
            })?;
        }

        Command::FetchProfiles { symbols } => {
            let _t = utils::Timer::start("Profiles");
            let repo = open_repo(&config)?;
            let Some(symbols) = target_symbols(&repo, &symbols)? else {
                return Ok(());
            };
            let source = Arc::new(FmpClient::new(&config.fmp)?);
            let stats = Pipeline::new(config, source).fetch_profiles(&repo, &symbols).await?;
            println!("{} profiles stored, {} errors", stats.stored, stats.errors);
        }

        Command::FetchMetrics { symbols, period } => {
            let _t = utils::Timer::start("Key metrics");
            let repo = open_repo(&config)?;
            let Some(symbols) = target_symbols(&repo, &symbols)? else {
                return Ok(());
            };

            let mut config = config;
            if let Some(period) = period {
                config.pipeline.metrics_period = period;
            }
            let source = Arc::new(FmpClient::new(&config.fmp)?);
            let stats = Pipeline::new(config, source).fetch_key_metrics(&repo, &symbols).await?;
            println!("{} metric rows stored, {} errors", stats.stored, stats.errors);
        }

        Command::FetchIndex { index } => {
            let repo = open_repo(&config)?;
            let source = Arc::new(FmpClient::new(&config.fmp)?);
            let index = utils::normalise_symbol(&index);
            let n = Pipeline::new(config, source).fetch_index_components(&repo, &index).await?;
            println!("{}: {} new members stored", index, n);
        }

        Command::LoadIndex { dir } => {
            let _t = utils::Timer::start("Index composition load");
            let repo = open_repo(&config)?;
            load_dir(&dir, &["csv"], |path| {
                let components = load_composition_file(path, |isin| repo.symbol_for_isin(isin))?;
                repo.insert_index_components(&components)
            })?;
        }

        Command::Profile { symbol } => {
            let repo = open_repo(&config)?;
            match repo.company_profile(&utils::normalise_symbol(&symbol))? {
                Some(p) => println!("{}", serde_json::to_string_pretty(&p)?),
                None => println!("No profile for {}. Run `fmp-etl fetch-profiles {}`.", symbol, symbol),
            }
        }

        Command::Members { index, json } => {
            let repo = open_repo(&config)?;
            let members = repo.index_members(&utils::normalise_symbol(&index))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&members)?);
            } else if members.is_empty() {
                println!("No members stored for {}.", index);
            } else {
                println!("{} members as of {}:", members.len(), members[0].as_of);
                for m in &members {
                    println!(
                        "  {:>4}  {:<12} {}",
                        m.rank.map(|r| r.to_string()).unwrap_or_default(),
                        m.symbol,
                        m.sector.as_deref().unwrap_or("")
                    );
                }
            }
        }

        Command::LoadDividends { dir } => {
            let _t = utils::Timer::start("Dividend bulk load");
            let repo = open_repo(&config)?;
            load_dir(&dir, &["json"], |path| {
                let (_, dividends) = load_dividend_file(path)?;
                repo.insert_dividends(&dividends)
            })?;
        }

        Command::Adjust { symbol, date, amount } => {
            let repo = open_repo(&config)?;
            let engine = AdjustmentEngine::new(&repo, config.adjustment.clone());
            match engine.apply_dividend_adjustment(&symbol, date, amount)? {
                AdjustmentStatus::Applied { rows_adjusted, ratio } => {
                    println!("Applied: {} rows rewritten (ratio {:.6})", rows_adjusted, ratio)
                }
                AdjustmentStatus::AlreadyApplied => println!("Already applied, nothing changed."),
            }
        }

        Command::Undeclared { since, json } => {
            let repo = open_repo(&config)?;
            let engine = AdjustmentEngine::new(&repo, config.adjustment.clone());
            let events = engine.find_undeclared_events(since.unwrap_or(since_default));
            if json {
                let events = events.collect::<Result<Vec<_>, _>>()?;
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                let mut found = 0usize;
                for event in events {
                    let event = event?;
                    println!("  {:<10} {}  {:>12.4}", event.symbol, event.date, event.implied_amount);
                    found += 1;
                }
                println!("{} undeclared events", found);
            }
        }

        Command::Reconcile { since, accept_implied } => {
            let _t = utils::Timer::start("Reconcile");
            let repo = open_repo(&config)?;
            let stats = pipeline::reconcile(
                &repo,
                &config.adjustment,
                since.unwrap_or(since_default),
                accept_implied,
            )?;
            println!(
                "{} candidates: {} applied, {} already applied, {} skipped, {} failed",
                stats.candidates, stats.applied, stats.already_applied, stats.skipped, stats.failed
            );
        }

        Command::Events { symbol, json } => {
            let repo = open_repo(&config)?;
            let symbol = symbol.map(|s| utils::normalise_symbol(&s));
            let events = repo.list_adjustment_events(symbol.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
                return Ok(());
            }
            if events.is_empty() {
                println!("No adjustments applied.");
            }
            for e in &events {
                println!(
                    "  {:<10} {}  amount {:>10.4}  ratio {:.6}  rows {:>6}  at {}",
                    e.symbol, e.event_date, e.amount, e.ratio, e.rows_adjusted,
                    e.applied_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Command::History { symbol } => {
            let repo = open_repo(&config)?;
            let series = repo.price_series(&utils::normalise_symbol(&symbol))?;
            if series.is_empty() {
                println!("No bars for {}.", symbol);
            }
            for p in &series {
                println!(
                    "  {}  {:>12.4}  {:>12.4}  {}",
                    p.date, p.close, p.adjusted_close,
                    p.event_signature.as_deref().map(|s| &s[..12.min(s.len())]).unwrap_or("")
                );
            }
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let bars = repo.bar_count()?;
            let symbols = repo.symbol_count()?;
            let dividends = repo.dividend_count()?;
            let events = repo.list_adjustment_events(None)?.len() as i64;
            let profiles = repo.profile_count()?;
            let metrics = repo.key_metric_count()?;
            let members = repo.index_component_count()?;
            let (min, max) = repo.date_range()?;
            println!("─────────────────────────────────");
            println!("  FMP ETL  Database Stats");
            println!("─────────────────────────────────");
            println!("  Symbols     : {}", utils::fmt_number(symbols));
            println!("  EOD bars    : {}", utils::fmt_number(bars));
            println!("  Dividends   : {}", utils::fmt_number(dividends));
            println!("  Adjustments : {}", utils::fmt_number(events));
            println!("  Profiles    : {}", utils::fmt_number(profiles));
            println!("  Key metrics : {}", utils::fmt_number(metrics));
            println!("  Index rows  : {}", utils::fmt_number(members));
            println!("  From        : {}", min.map(|d| d.to_string()).unwrap_or("—".into()));
            println!("  To          : {}", max.map(|d| d.to_string()).unwrap_or("—".into()));
            println!("─────────────────────────────────");
        }

        Command::Symbols => {
            let repo = open_repo(&config)?;
            let syms = repo.list_symbols()?;
            if syms.is_empty() {
                println!("No symbols. Run `fmp-etl fetch-symbols` or `fmp-etl load-prices` first.");
            } else {
                println!("{} symbols:", syms.len());
                for s in &syms {
                    println!("  {}", s);
                }
            }
        }
    }

    Ok(())
}

/// Explicit symbols, or every stored one. `None` when there is nothing to do.
fn target_symbols(repo: &Repository, symbols: &[String]) -> Result<Option<Vec<String>>> {
    let symbols = if symbols.is_empty() {
        repo.list_symbols()?
    } else {
        symbols.iter().map(|s| utils::normalise_symbol(s)).collect()
    };
    if symbols.is_empty() {
        println!("No symbols. Pass some or run `fmp-etl fetch-symbols` first.");
        return Ok(None);
    }
    Ok(Some(symbols))
}

fn open_repo(config: &AppConfig) -> Result<Repository> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(repo)
}

/// Run `load` over every matching file in `dir`; one bad file does not stop the rest.
fn load_dir<F>(dir: &Path, exts: &[&str], mut load: F) -> Result<()>
where
    F: FnMut(&Path) -> Result<usize>,
{
    let files = discover_files(dir, exts)?;
    info!("Found {} files in {:?}", files.len(), dir);

    let mut inserted = 0usize;
    let mut errors = 0usize;
    for path in &files {
        match load(path) {
            Ok(n) => inserted += n,
            Err(e) => {
                warn!("Error loading {:?}: {:#}", path, e);
                errors += 1;
            }
        }
    }

    info!("Done: {} rows inserted, {} errors", inserted, errors);
    Ok(())
}
