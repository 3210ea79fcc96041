use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

// ── Symbol ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockSymbol {
    pub symbol: String,
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub exchange_short_name: Option<String>, // NYSE, NASDAQ, EURONEXT
    pub price: Option<f64>,
    pub kind: Option<String>, // stock, etf, trust
    pub updated_at: NaiveDateTime,
}

// ── Equity daily bar ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub adj_close: f64,
    pub volume: Option<i64>,
    pub unadjusted_volume: Option<i64>,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
    pub vwap: Option<f64>,
    pub fetched_at: NaiveDateTime,
}

// ── Dividend ──────────────────────────────────────────────────────────────────

/// Dividend as declared by the upstream feed. `date` is the detachment date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dividend {
    pub symbol: String,
    pub date: NaiveDate,
    pub dividend: f64,
    pub adj_dividend: Option<f64>,
    pub record_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
    pub declaration_date: Option<NaiveDate>,
    pub fetched_at: NaiveDateTime,
}

// ── Company profile ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanyProfile {
    pub symbol: String,
    pub company_name: Option<String>,
    pub currency: Option<String>,
    pub exchange_short_name: Option<String>,
    pub cik: Option<String>,
    pub isin: Option<String>,
    pub cusip: Option<String>,
    pub industry: Option<String>,
    pub sector: Option<String>,
    pub country: Option<String>,
    pub website: Option<String>,
    pub description: Option<String>,
    pub ceo: Option<String>,
    pub image: Option<String>,
    pub ipo_date: Option<NaiveDate>,
    pub beta: Option<f64>,
    pub vol_avg: Option<f64>,
    pub mkt_cap: Option<f64>,
    pub is_etf: Option<bool>,
    pub is_actively_trading: Option<bool>,
    pub is_adr: Option<bool>,
    pub is_fund: Option<bool>,
    pub updated_at: NaiveDateTime,
}

// ── Key metrics ───────────────────────────────────────────────────────────────

/// Per-period fundamentals. The most used ratios get their own column; the
/// rest of the upstream row is kept as JSON in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyMetrics {
    pub symbol: String,
    pub date: NaiveDate,
    pub calendar_year: Option<String>,
    pub period: Option<String>, // Q1..Q4, FY
    pub revenue_per_share: Option<f64>,
    pub net_income_per_share: Option<f64>,
    pub operating_cash_flow_per_share: Option<f64>,
    pub free_cash_flow_per_share: Option<f64>,
    pub cash_per_share: Option<f64>,
    pub book_value_per_share: Option<f64>,
    pub market_cap: Option<f64>,
    pub enterprise_value: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub price_to_sales_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub ev_to_sales: Option<f64>,
    pub ev_to_ebitda: Option<f64>,
    pub earnings_yield: Option<f64>,
    pub free_cash_flow_yield: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub debt_to_assets: Option<f64>,
    pub current_ratio: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub payout_ratio: Option<f64>,
    pub roic: Option<f64>,
    pub roe: Option<f64>,
    pub extra: Option<String>,
    pub fetched_at: NaiveDateTime,
}

// ── Index membership ──────────────────────────────────────────────────────────

/// One constituent of an index as of `as_of`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexComponent {
    pub index_symbol: String, // SP500, NASDAQ, SXXP
    pub symbol: String,
    pub as_of: NaiveDate,
    pub index_name: Option<String>,
    pub index_isin: Option<String>,
    pub isin: Option<String>,
    pub rank: Option<i32>,
    pub sector: Option<String>,
    pub date_first_added: Option<NaiveDate>,
    pub fetched_at: NaiveDateTime,
}

// ── Adjustment views ──────────────────────────────────────────────────────────

/// The slice of a daily bar the adjustment engine works on.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub close: f64,
    pub adjusted_close: f64,
    pub event_signature: Option<String>,
}

/// A dividend (or equivalent price impact) detaching on `event_date`.
#[derive(Debug, Clone, PartialEq)]
pub struct CorporateEvent {
    pub symbol: String,
    pub event_date: NaiveDate,
    pub amount: f64,
}

/// Ledger row written once per applied event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjustmentRecord {
    pub symbol: String,
    pub signature: String,
    pub event_date: NaiveDate,
    pub amount: f64,
    pub detachment_close: f64,
    pub ratio: f64,
    pub rows_adjusted: i64,
    pub applied_at: NaiveDateTime,
}

/// Divergence between close and adjusted close with no event recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UndeclaredEvent {
    pub symbol: String,
    pub date: NaiveDate,
    pub implied_amount: f64,
}

// ── Raw FMP payloads ──────────────────────────────────────────────────────────

/// `stock/list` entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSymbolRow {
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub exchange_short_name: Option<String>,
    pub price: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// `historical-price-full/{symbol}` body. Unknown symbols come back as `{}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPriceHistory {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub historical: Vec<RawEodRow>,
}

/// One EOD row, shared by the JSON endpoint and CSV exports.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEodRow {
    pub date: Option<String>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<f64>,
    pub unadjusted_volume: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub vwap: Option<f64>,
}

/// `historical-price-full/stock_dividend/{symbol}` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDividendHistory {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub historical: Vec<RawDividendRow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDividendRow {
    pub date: Option<String>,
    pub adj_dividend: Option<f64>,
    pub dividend: Option<f64>,
    pub record_date: Option<String>,
    pub payment_date: Option<String>,
    pub declaration_date: Option<String>,
}

/// `profile/{symbol}` entry. `cik` and `cusip` arrive as strings or numbers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCompanyProfile {
    pub symbol: Option<String>,
    pub company_name: Option<String>,
    pub currency: Option<String>,
    pub exchange_short_name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub cik: Option<String>,
    pub isin: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub cusip: Option<String>,
    pub industry: Option<String>,
    pub sector: Option<String>,
    pub country: Option<String>,
    pub website: Option<String>,
    pub description: Option<String>,
    pub ceo: Option<String>,
    pub image: Option<String>,
    pub ipo_date: Option<String>,
    pub beta: Option<f64>,
    pub vol_avg: Option<f64>,
    pub mkt_cap: Option<f64>,
    pub is_etf: Option<bool>,
    pub is_actively_trading: Option<bool>,
    pub is_adr: Option<bool>,
    pub is_fund: Option<bool>,
}

/// `key-metrics/{symbol}` entry. Fields without a column land in `extra`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawKeyMetrics {
    pub symbol: Option<String>,
    pub date: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub calendar_year: Option<String>,
    pub period: Option<String>,
    pub revenue_per_share: Option<f64>,
    pub net_income_per_share: Option<f64>,
    pub operating_cash_flow_per_share: Option<f64>,
    pub free_cash_flow_per_share: Option<f64>,
    pub cash_per_share: Option<f64>,
    pub book_value_per_share: Option<f64>,
    pub market_cap: Option<f64>,
    pub enterprise_value: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub price_to_sales_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub ev_to_sales: Option<f64>,
    #[serde(rename = "enterpriseValueOverEBITDA")]
    pub ev_to_ebitda: Option<f64>,
    pub earnings_yield: Option<f64>,
    pub free_cash_flow_yield: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub debt_to_assets: Option<f64>,
    pub current_ratio: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub payout_ratio: Option<f64>,
    pub roic: Option<f64>,
    pub roe: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `{index}_constituent` entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConstituentRow {
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub date_first_added: Option<String>,
}

/// Row of a STOXX-style composition export.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCompositionRow {
    #[serde(rename = "ISIN")]
    pub isin: Option<String>,
    #[serde(rename = "Creation_Date")]
    pub creation_date: Option<String>,
    #[serde(rename = "Index_Symbol")]
    pub index_symbol: Option<String>,
    #[serde(rename = "Index_Name")]
    pub index_name: Option<String>,
    #[serde(rename = "Index ISIN")]
    pub index_isin: Option<String>,
    #[serde(rename = "Rank (FINAL)")]
    pub rank: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
