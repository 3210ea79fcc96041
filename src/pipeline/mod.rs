//! Pipeline orchestrator: ties the FMP source, storage and the adjustment
//! engine together.
//!
//! ## Run modes
//!
//! `run()`: fetch mode (cron use):
//!   1. For each symbol, fetch price history and declared dividends concurrently
//!   2. Insert into daily_bars / dividends on the calling task
//!   Idempotent: existing (symbol, date) rows are never overwritten, so applied
//!   adjustments survive re-fetches. With `pipeline.refresh_bars` set, stored
//!   bars take the upstream OHLCV while keeping their adjusted close.
//!
//! `refresh_symbols()`: pull the upstream listing into the symbols table.
//!
//! `fetch_profiles()` / `fetch_key_metrics()` / `fetch_index_components()`:
//!   reference data, fetched with the same bounded concurrency.
//!
//! `reconcile()`, offline: turn undeclared-event candidates into applied
//!   adjustments, using stored dividends to confirm amounts.

use crate::adjust::{AdjustmentEngine, AdjustmentStatus};
use crate::config::{AdjustmentConfig, AppConfig};
use crate::fmp::MarketDataSource;
use crate::models::{DailyBar, Dividend};
use crate::storage::Repository;
use anyhow::Result;
use chrono::NaiveDate;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct Pipeline {
    config: AppConfig,
    source: Arc<dyn MarketDataSource>,
}

impl Pipeline {
    pub fn new(config: AppConfig, source: Arc<dyn MarketDataSource>) -> Self {
        Self { config, source }
    }

    pub async fn refresh_symbols(&self, repo: &Repository) -> Result<usize> {
        let symbols = self.source.fetch_symbol_list().await?;
        repo.upsert_symbols(&symbols)
    }

    pub async fn run(&self, repo: &Repository, symbols: &[String]) -> Result<PipelineStats> {
        let run_id = repo.begin_fetch_run()?;

        info!("=== Fetching {} symbols (concurrency {}) ===",
            symbols.len(), self.config.pipeline.concurrency);

        let mut tasks = self.spawn_per_symbol(symbols, |source, symbol| async move {
            let bars = source.fetch_daily_bars(&symbol).await?;
            let dividends = source.fetch_dividends(&symbol).await?;
            Ok::<(Vec<DailyBar>, Vec<Dividend>), anyhow::Error>((bars, dividends))
        });

        let mut stats = PipelineStats {
            run_id,
            symbols_processed: symbols.len(),
            ..PipelineStats::default()
        };

        // DuckDB writes stay on this task; only the network work is spread out.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((symbol, Ok((bars, dividends)))) => {
                    match store_symbol(repo, &bars, &dividends, self.config.pipeline.refresh_bars) {
                        Ok(stored) => {
                            info!("{}: {} new bars, {} refreshed, {} new dividends (latest: {:?})",
                                symbol, stored.bars_inserted, stored.bars_refreshed,
                                stored.dividends_inserted, bars.iter().map(|b| b.date).max());
                            stats.bars_inserted += stored.bars_inserted;
                            stats.bars_refreshed += stored.bars_refreshed;
                            stats.dividends_inserted += stored.dividends_inserted;
                        }
                        Err(e) => { warn!("{}: {:#}", symbol, e); stats.errors += 1; }
                    }
                }
                Ok((symbol, Err(e))) => { warn!("{}: {:#}", symbol, e); stats.errors += 1; }
                Err(e) => { error!("Fetch task panicked: {}", e); stats.errors += 1; }
            }
        }

        let error_msg = (stats.errors > 0).then(|| format!("{} errors", stats.errors));
        repo.finish_fetch_run(
            run_id,
            stats.symbols_processed,
            stats.bars_inserted,
            stats.dividends_inserted,
            error_msg.as_deref(),
        )?;

        let status = repo.fetch_run_status(run_id)?;
        let (min_date, max_date) = repo.date_range()?;
        info!("=== Run {} {}: {} symbols | {} new bars | {} refreshed | {} new dividends | {} errors | DB range: {:?} → {:?} ===",
            run_id, status, stats.symbols_processed, stats.bars_inserted, stats.bars_refreshed,
            stats.dividends_inserted, stats.errors, min_date, max_date,
        );

        Ok(stats)
    }

    /// Fetch and upsert one profile per symbol.
    pub async fn fetch_profiles(&self, repo: &Repository, symbols: &[String]) -> Result<FetchStats> {
        let mut tasks = self.spawn_per_symbol(symbols, |source, symbol| async move {
            source.fetch_profile(&symbol).await
        });

        let mut stats = FetchStats { requested: symbols.len(), ..FetchStats::default() };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Some(profile)))) => match repo.upsert_company_profiles(&[profile]) {
                    Ok(n) => stats.stored += n,
                    Err(e) => { warn!("{:#}", e); stats.errors += 1; }
                },
                Ok((symbol, Ok(None))) => debug!("{}: no profile", symbol),
                Ok((symbol, Err(e))) => { warn!("{}: {:#}", symbol, e); stats.errors += 1; }
                Err(e) => { error!("Profile task panicked: {}", e); stats.errors += 1; }
            }
        }

        info!("Profiles: {:?}", stats);
        Ok(stats)
    }

    /// Fetch key metrics for the configured period; existing (symbol, date) rows are kept.
    pub async fn fetch_key_metrics(&self, repo: &Repository, symbols: &[String]) -> Result<FetchStats> {
        let period = Arc::new(self.config.pipeline.metrics_period.clone());
        let mut tasks = self.spawn_per_symbol(symbols, move |source, symbol| {
            let period = Arc::clone(&period);
            async move { source.fetch_key_metrics(&symbol, &period).await }
        });

        let mut stats = FetchStats { requested: symbols.len(), ..FetchStats::default() };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((symbol, Ok(metrics))) => match repo.insert_key_metrics(&metrics) {
                    Ok(n) => {
                        debug!("{}: {} new metric rows", symbol, n);
                        stats.stored += n;
                    }
                    Err(e) => { warn!("{}: {:#}", symbol, e); stats.errors += 1; }
                },
                Ok((symbol, Err(e))) => { warn!("{}: {:#}", symbol, e); stats.errors += 1; }
                Err(e) => { error!("Metrics task panicked: {}", e); stats.errors += 1; }
            }
        }

        info!("Key metrics: {:?}", stats);
        Ok(stats)
    }

    /// Snapshot today's membership of `index`.
    pub async fn fetch_index_components(&self, repo: &Repository, index: &str) -> Result<usize> {
        let members = self.source.fetch_index_components(index).await?;
        let stored = repo.insert_index_components(&members)?;
        info!("{}: {} members fetched, {} new", index, members.len(), stored);
        Ok(stored)
    }

    /// One task per symbol, each holding a permit from a semaphore sized by
    /// `pipeline.concurrency` while it talks to the source.
    fn spawn_per_symbol<T, F, Fut>(&self, symbols: &[String], fetch: F) -> JoinSet<(String, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn MarketDataSource>, String) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(self.config.pipeline.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for symbol in symbols {
            let sem = Arc::clone(&sem);
            let work = fetch(Arc::clone(&self.source), symbol.clone());
            let symbol = symbol.clone();

            tasks.spawn(async move {
                let fetched = match sem.acquire_owned().await {
                    Ok(_permit) => work.await,
                    Err(e) => Err(e.into()),
                };
                (symbol, fetched)
            });
        }
        tasks
    }
}

#[derive(Debug, Default)]
struct Stored {
    bars_inserted: usize,
    bars_refreshed: usize,
    dividends_inserted: usize,
}

fn store_symbol(repo: &Repository, bars: &[DailyBar], dividends: &[Dividend], refresh: bool) -> Result<Stored> {
    let (bars_inserted, bars_refreshed) = if refresh {
        repo.refresh_daily_bars(bars)?
    } else {
        (repo.insert_daily_bars(bars)?, 0)
    };
    Ok(Stored {
        bars_inserted,
        bars_refreshed,
        dividends_inserted: repo.insert_dividends(dividends)?,
    })
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub run_id: i64,
    pub symbols_processed: usize,
    pub bars_inserted: usize,
    pub bars_refreshed: usize,
    pub dividends_inserted: usize,
    pub errors: usize,
}

#[derive(Debug, Default, PartialEq)]
pub struct FetchStats {
    pub requested: usize,
    pub stored: usize,
    pub errors: usize,
}

// ── Reconciliation ───────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
pub struct ReconcileStats {
    pub candidates: usize,
    pub applied: usize,
    pub already_applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Feed every undeclared-event candidate into the engine.
///
/// The amount comes from the first stored dividend after the candidate date,
/// applied on that dividend's own date. Without one, the candidate's implied
/// amount is used only when `accept_implied` is set.
pub fn reconcile(
    repo: &Repository,
    config: &AdjustmentConfig,
    since: NaiveDate,
    accept_implied: bool,
) -> Result<ReconcileStats> {
    let engine = AdjustmentEngine::new(repo, config.clone());
    let mut stats = ReconcileStats::default();

    for candidate in engine.find_undeclared_events(since) {
        let candidate = candidate?;
        stats.candidates += 1;

        let (event_date, amount) = match repo.next_dividend_after(&candidate.symbol, candidate.date)? {
            Some(div) => (div.date, div.dividend),
            None if accept_implied => (candidate.date, candidate.implied_amount),
            None => {
                debug!("{} {}: no declared dividend, implied {} left for review",
                    candidate.symbol, candidate.date, candidate.implied_amount);
                stats.skipped += 1;
                continue;
            }
        };

        match engine.apply_dividend_adjustment(&candidate.symbol, event_date, amount) {
            Ok(AdjustmentStatus::Applied { .. }) => stats.applied += 1,
            Ok(AdjustmentStatus::AlreadyApplied) => stats.already_applied += 1,
            Err(e) => {
                warn!("{} {}: {}", candidate.symbol, event_date, e);
                stats.failed += 1;
            }
        }
    }

    info!("Reconcile: {:?}", stats);
    Ok(stats)
}
