use crate::models::{
    CompanyProfile, DailyBar, Dividend, IndexComponent, KeyMetrics, RawCompanyProfile,
    RawConstituentRow, RawDividendRow, RawEodRow, RawKeyMetrics, RawSymbolRow, StockSymbol,
};
use crate::utils::normalise_symbol;
use chrono::{NaiveDate, NaiveDateTime};
use tracing::warn;

// ── Parsers ───────────────────────────────────────────────────────────────────

/// FMP serves ISO dates; CSV exports sometimes carry a time or US format.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%m/%d/%Y") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%b %d, %Y") {
        return Some(d);
    }
    // Compact form used by index composition files
    if s.len() == 8 {
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y%m%d") {
            return Some(d);
        }
    }

    None
}

/// Blank and whitespace-only strings become `None`.
fn non_blank(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Volumes arrive as floats (`1.2345E7`) in some payloads.
fn to_volume(v: Option<f64>) -> Option<i64> {
    v.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v.round() as i64)
}

// ── stock/list → StockSymbol ──────────────────────────────────────────────────

pub fn clean_symbol_rows(rows: Vec<RawSymbolRow>, now: NaiveDateTime) -> Vec<StockSymbol> {
    rows.iter()
        .filter_map(|row| {
            let symbol = non_blank(&row.symbol)?;
            Some(StockSymbol {
                symbol: normalise_symbol(&symbol),
                name: non_blank(&row.name),
                exchange: non_blank(&row.exchange),
                exchange_short_name: non_blank(&row.exchange_short_name),
                price: row.price,
                kind: non_blank(&row.kind),
                updated_at: now,
            })
        })
        .collect()
}

// ── EOD row → DailyBar ────────────────────────────────────────────────────────

pub fn eod_row_to_bar(symbol: &str, row: &RawEodRow, now: NaiveDateTime) -> Option<DailyBar> {
    let date = parse_date(row.date.as_deref()?)?;
    let close = row.close?;

    if !close.is_finite() || close <= 0.0 {
        warn!("Invalid close {} for {} on {}", close, symbol, date);
        return None;
    }

    // A fresh bar starts out unadjusted unless the feed already adjusted it.
    let adj_close = row.adj_close.filter(|v| v.is_finite()).unwrap_or(close);

    Some(DailyBar {
        symbol: normalise_symbol(symbol),
        date,
        open: row.open,
        high: row.high,
        low: row.low,
        close,
        adj_close,
        volume: to_volume(row.volume),
        unadjusted_volume: to_volume(row.unadjusted_volume),
        change: row.change,
        change_pct: row.change_percent,
        vwap: row.vwap,
        fetched_at: now,
    })
}

pub fn clean_eod_rows(symbol: &str, rows: &[RawEodRow], now: NaiveDateTime) -> Vec<DailyBar> {
    rows.iter()
        .filter_map(|r| eod_row_to_bar(symbol, r, now))
        .collect()
}

// ── Dividend row → Dividend ───────────────────────────────────────────────────

pub fn dividend_row_to_dividend(
    symbol: &str,
    row: &RawDividendRow,
    now: NaiveDateTime,
) -> Option<Dividend> {
    let date = parse_date(row.date.as_deref()?)?;
    let dividend = row.dividend.or(row.adj_dividend)?;

    if !dividend.is_finite() || dividend <= 0.0 {
        warn!("Invalid dividend {} for {} on {}", dividend, symbol, date);
        return None;
    }

    Some(Dividend {
        symbol: normalise_symbol(symbol),
        date,
        dividend,
        adj_dividend: row.adj_dividend,
        record_date: row.record_date.as_deref().and_then(parse_date),
        payment_date: row.payment_date.as_deref().and_then(parse_date),
        declaration_date: row.declaration_date.as_deref().and_then(parse_date),
        fetched_at: now,
    })
}

pub fn clean_dividend_rows(
    symbol: &str,
    rows: &[RawDividendRow],
    now: NaiveDateTime,
) -> Vec<Dividend> {
    rows.iter()
        .filter_map(|r| dividend_row_to_dividend(symbol, r, now))
        .collect()
}

// ── profile/{symbol} → CompanyProfile ─────────────────────────────────────────

pub fn clean_profiles(rows: Vec<RawCompanyProfile>, now: NaiveDateTime) -> Vec<CompanyProfile> {
    rows.into_iter()
        .filter_map(|row| {
            let symbol = non_blank(&row.symbol)?;
            Some(CompanyProfile {
                symbol: normalise_symbol(&symbol),
                company_name: non_blank(&row.company_name),
                currency: non_blank(&row.currency),
                exchange_short_name: non_blank(&row.exchange_short_name),
                cik: non_blank(&row.cik),
                isin: non_blank(&row.isin),
                cusip: non_blank(&row.cusip),
                industry: non_blank(&row.industry),
                sector: non_blank(&row.sector),
                country: non_blank(&row.country),
                website: non_blank(&row.website),
                description: non_blank(&row.description),
                ceo: non_blank(&row.ceo),
                image: non_blank(&row.image),
                ipo_date: row.ipo_date.as_deref().and_then(parse_date),
                beta: row.beta,
                vol_avg: row.vol_avg,
                mkt_cap: row.mkt_cap,
                is_etf: row.is_etf,
                is_actively_trading: row.is_actively_trading,
                is_adr: row.is_adr,
                is_fund: row.is_fund,
                updated_at: now,
            })
        })
        .collect()
}

// ── key-metrics/{symbol} → KeyMetrics ─────────────────────────────────────────

pub fn key_metrics_row(symbol: &str, row: RawKeyMetrics, now: NaiveDateTime) -> Option<KeyMetrics> {
    let date = parse_date(row.date.as_deref()?)?;
    let symbol = non_blank(&row.symbol).unwrap_or_else(|| symbol.to_string());
    let extra = if row.extra.is_empty() {
        None
    } else {
        serde_json::to_string(&row.extra).ok()
    };

    Some(KeyMetrics {
        symbol: normalise_symbol(&symbol),
        date,
        calendar_year: non_blank(&row.calendar_year),
        period: non_blank(&row.period),
        revenue_per_share: row.revenue_per_share,
        net_income_per_share: row.net_income_per_share,
        operating_cash_flow_per_share: row.operating_cash_flow_per_share,
        free_cash_flow_per_share: row.free_cash_flow_per_share,
        cash_per_share: row.cash_per_share,
        book_value_per_share: row.book_value_per_share,
        market_cap: row.market_cap,
        enterprise_value: row.enterprise_value,
        pe_ratio: row.pe_ratio,
        price_to_sales_ratio: row.price_to_sales_ratio,
        pb_ratio: row.pb_ratio,
        ev_to_sales: row.ev_to_sales,
        ev_to_ebitda: row.ev_to_ebitda,
        earnings_yield: row.earnings_yield,
        free_cash_flow_yield: row.free_cash_flow_yield,
        debt_to_equity: row.debt_to_equity,
        debt_to_assets: row.debt_to_assets,
        current_ratio: row.current_ratio,
        dividend_yield: row.dividend_yield,
        payout_ratio: row.payout_ratio,
        roic: row.roic,
        roe: row.roe,
        extra,
        fetched_at: now,
    })
}

pub fn clean_key_metrics(symbol: &str, rows: Vec<RawKeyMetrics>, now: NaiveDateTime) -> Vec<KeyMetrics> {
    rows.into_iter()
        .filter_map(|r| key_metrics_row(symbol, r, now))
        .collect()
}

// ── {index}_constituent → IndexComponent ──────────────────────────────────────

pub fn clean_constituents(
    index_symbol: &str,
    rows: &[RawConstituentRow],
    as_of: NaiveDate,
    now: NaiveDateTime,
) -> Vec<IndexComponent> {
    rows.iter()
        .filter_map(|row| {
            let symbol = non_blank(&row.symbol)?;
            Some(IndexComponent {
                index_symbol: normalise_symbol(index_symbol),
                symbol: normalise_symbol(&symbol),
                as_of,
                index_name: None,
                index_isin: None,
                isin: None,
                rank: None,
                sector: non_blank(&row.sector),
                date_first_added: row.date_first_added.as_deref().and_then(parse_date),
                fetched_at: now,
            })
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
