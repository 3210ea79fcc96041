//! Fixtures for tests that need a migrated in-memory store.

use super::Repository;
use crate::models::{DailyBar, Dividend};
use chrono::{NaiveDate, Utc};

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn bar(symbol: &str, day: &str, close: f64, adj_close: f64) -> DailyBar {
    DailyBar {
        symbol: symbol.to_string(),
        date: date(day),
        open: None,
        high: None,
        low: None,
        close,
        adj_close,
        volume: Some(1_000),
        unadjusted_volume: None,
        change: None,
        change_pct: None,
        vwap: None,
        fetched_at: Utc::now().naive_utc(),
    }
}

pub fn dividend(symbol: &str, day: &str, amount: f64) -> Dividend {
    Dividend {
        symbol: symbol.to_string(),
        date: date(day),
        dividend: amount,
        adj_dividend: Some(amount),
        record_date: None,
        payment_date: None,
        declaration_date: None,
        fetched_at: Utc::now().naive_utc(),
    }
}

pub fn seeded(bars: &[DailyBar]) -> Repository {
    let repo = Repository::open_in_memory().unwrap();
    repo.run_migrations().unwrap();
    repo.insert_daily_bars(bars).unwrap();
    repo
}
