pub mod cleaner;
pub mod http_client;

use crate::config::FmpConfig;
use crate::models::{
    CompanyProfile, DailyBar, Dividend, IndexComponent, KeyMetrics, RawCompanyProfile,
    RawConstituentRow, RawDividendHistory, RawKeyMetrics, RawPriceHistory, RawSymbolRow,
    StockSymbol,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use self::cleaner::{
    clean_constituents, clean_dividend_rows, clean_eod_rows, clean_key_metrics, clean_profiles,
    clean_symbol_rows,
};
use self::http_client::HttpClient;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable data source abstraction.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_symbol_list(&self) -> Result<Vec<StockSymbol>>;
    async fn fetch_daily_bars(&self, symbol: &str) -> Result<Vec<DailyBar>>;
    async fn fetch_dividends(&self, symbol: &str) -> Result<Vec<Dividend>>;
    async fn fetch_profile(&self, symbol: &str) -> Result<Option<CompanyProfile>>;
    /// `period` is `quarter` or `annual`.
    async fn fetch_key_metrics(&self, symbol: &str, period: &str) -> Result<Vec<KeyMetrics>>;
    /// Current members of `index` (e.g. `SP500`, `NASDAQ`, `DOWJONES`).
    async fn fetch_index_components(&self, index: &str) -> Result<Vec<IndexComponent>>;
}

// ── Financial Modeling Prep ───────────────────────────────────────────────────

pub struct FmpClient {
    client: HttpClient,
}

impl FmpClient {
    pub fn new(config: &FmpConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            warn!("No FMP api key configured (set FMP__FMP__API_KEY); requests will be rejected");
        }
        Ok(Self {
            client: HttpClient::new(config)?,
        })
    }
}

#[async_trait]
impl MarketDataSource for FmpClient {
    async fn fetch_symbol_list(&self) -> Result<Vec<StockSymbol>> {
        info!("Fetching symbol list");
        let rows: Vec<RawSymbolRow> = self
            .client
            .get_json("stock/list")
            .await
            .context("Symbol list fetch failed")?;

        let symbols = clean_symbol_rows(rows, Utc::now().naive_utc());
        info!("Total symbols listed: {}", symbols.len());
        Ok(symbols)
    }

    async fn fetch_daily_bars(&self, symbol: &str) -> Result<Vec<DailyBar>> {
        let body: RawPriceHistory = self
            .client
            .get_json(&format!("historical-price-full/{}", symbol))
            .await
            .with_context(|| format!("Failed to fetch price history for {}", symbol))?;

        if body.historical.is_empty() {
            warn!("{}: no price history returned", symbol);
        }

        let bars = clean_eod_rows(symbol, &body.historical, Utc::now().naive_utc());
        debug!("{}: {} of {} rows kept", symbol, bars.len(), body.historical.len());
        Ok(bars)
    }

    async fn fetch_dividends(&self, symbol: &str) -> Result<Vec<Dividend>> {
        let body: RawDividendHistory = self
            .client
            .get_json(&format!("historical-price-full/stock_dividend/{}", symbol))
            .await
            .with_context(|| format!("Failed to fetch dividends for {}", symbol))?;

        let dividends = clean_dividend_rows(symbol, &body.historical, Utc::now().naive_utc());
        debug!("{}: {} dividends", symbol, dividends.len());
        Ok(dividends)
    }

    async fn fetch_profile(&self, symbol: &str) -> Result<Option<CompanyProfile>> {
        let rows: Vec<RawCompanyProfile> = self
            .client
            .get_json(&format!("profile/{}", symbol))
            .await
            .with_context(|| format!("Failed to fetch profile for {}", symbol))?;

        let profile = clean_profiles(rows, Utc::now().naive_utc()).into_iter().next();
        if profile.is_none() {
            warn!("{}: no profile returned", symbol);
        }
        Ok(profile)
    }

    async fn fetch_key_metrics(&self, symbol: &str, period: &str) -> Result<Vec<KeyMetrics>> {
        let rows: Vec<RawKeyMetrics> = self
            .client
            .get_json_with(&format!("key-metrics/{}", symbol), &[("period", period)])
            .await
            .with_context(|| format!("Failed to fetch key metrics for {}", symbol))?;

        let total = rows.len();
        let metrics = clean_key_metrics(symbol, rows, Utc::now().naive_utc());
        debug!("{}: {} of {} {} metric rows kept", symbol, metrics.len(), total, period);
        Ok(metrics)
    }

    async fn fetch_index_components(&self, index: &str) -> Result<Vec<IndexComponent>> {
        let rows: Vec<RawConstituentRow> = self
            .client
            .get_json(&format!("{}_constituent", index.to_lowercase()))
            .await
            .with_context(|| format!("Failed to fetch constituents of {}", index))?;

        let now = Utc::now().naive_utc();
        let members = clean_constituents(index, &rows, now.date(), now);
        info!("{}: {} constituents", index, members.len());
        Ok(members)
    }
}
