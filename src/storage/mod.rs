mod fundamentals;
mod prices;

#[cfg(test)]
pub mod test_support;

use crate::models::{AdjustmentRecord, DailyBar, Dividend, PriceRecord, StockSymbol};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use duckdb::{params, Connection};
use std::path::Path;
use tracing::info;

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS symbols (
    symbol              VARCHAR PRIMARY KEY,
    name                VARCHAR,
    exchange            VARCHAR,
    exchange_short_name VARCHAR,
    price               DOUBLE,
    kind                VARCHAR,
    updated_at          TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_bars (
    symbol            VARCHAR  NOT NULL,
    date              DATE     NOT NULL,
    open              DOUBLE,
    high              DOUBLE,
    low               DOUBLE,
    close             DOUBLE   NOT NULL,
    -- Rewritten by dividend adjustments, never by ingestion
    adj_close         DOUBLE   NOT NULL,
    volume            BIGINT,
    unadjusted_volume BIGINT,
    change            DOUBLE,
    change_pct        DOUBLE,
    vwap              DOUBLE,
    -- Set on the detachment row of an applied event
    event_signature   VARCHAR,
    fetched_at        TIMESTAMP NOT NULL,
    PRIMARY KEY (symbol, date)
);

CREATE TABLE IF NOT EXISTS dividends (
    symbol            VARCHAR NOT NULL,
    date              DATE    NOT NULL,
    dividend          DOUBLE  NOT NULL,
    adj_dividend      DOUBLE,
    record_date       DATE,
    payment_date      DATE,
    declaration_date  DATE,
    fetched_at        TIMESTAMP NOT NULL,
    PRIMARY KEY (symbol, date)
);

CREATE TABLE IF NOT EXISTS adjustment_events (
    symbol            VARCHAR NOT NULL,
    signature         VARCHAR NOT NULL,
    event_date        DATE    NOT NULL,
    amount            DOUBLE  NOT NULL,
    detachment_close  DOUBLE  NOT NULL,
    ratio             DOUBLE  NOT NULL,
    rows_adjusted     BIGINT  NOT NULL,
    applied_at        TIMESTAMP NOT NULL,
    PRIMARY KEY (symbol, signature)
);

CREATE TABLE IF NOT EXISTS company_profiles (
    symbol              VARCHAR PRIMARY KEY,
    company_name        VARCHAR,
    currency            VARCHAR,
    exchange_short_name VARCHAR,
    cik                 VARCHAR,
    isin                VARCHAR,
    cusip               VARCHAR,
    industry            VARCHAR,
    sector              VARCHAR,
    country             VARCHAR,
    website             VARCHAR,
    description         VARCHAR,
    ceo                 VARCHAR,
    image               VARCHAR,
    ipo_date            DATE,
    beta                DOUBLE,
    vol_avg             DOUBLE,
    mkt_cap             DOUBLE,
    is_etf              BOOLEAN,
    is_actively_trading BOOLEAN,
    is_adr              BOOLEAN,
    is_fund             BOOLEAN,
    updated_at          TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS key_metrics (
    symbol                        VARCHAR NOT NULL,
    date                          DATE    NOT NULL,
    calendar_year                 VARCHAR,
    period                        VARCHAR,
    revenue_per_share             DOUBLE,
    net_income_per_share          DOUBLE,
    operating_cash_flow_per_share DOUBLE,
    free_cash_flow_per_share      DOUBLE,
    cash_per_share                DOUBLE,
    book_value_per_share          DOUBLE,
    market_cap                    DOUBLE,
    enterprise_value              DOUBLE,
    pe_ratio                      DOUBLE,
    price_to_sales_ratio          DOUBLE,
    pb_ratio                      DOUBLE,
    ev_to_sales                   DOUBLE,
    ev_to_ebitda                  DOUBLE,
    earnings_yield                DOUBLE,
    free_cash_flow_yield          DOUBLE,
    debt_to_equity                DOUBLE,
    debt_to_assets                DOUBLE,
    current_ratio                 DOUBLE,
    dividend_yield                DOUBLE,
    payout_ratio                  DOUBLE,
    roic                          DOUBLE,
    roe                           DOUBLE,
    -- Remaining upstream fields as a JSON object
    extra                         VARCHAR,
    fetched_at                    TIMESTAMP NOT NULL,
    PRIMARY KEY (symbol, date)
);

CREATE TABLE IF NOT EXISTS index_components (
    index_symbol      VARCHAR NOT NULL,
    symbol            VARCHAR NOT NULL,
    as_of             DATE    NOT NULL,
    index_name        VARCHAR,
    index_isin        VARCHAR,
    isin              VARCHAR,
    index_rank        INTEGER,
    sector            VARCHAR,
    date_first_added  DATE,
    fetched_at        TIMESTAMP NOT NULL,
    PRIMARY KEY (index_symbol, symbol, as_of)
);

CREATE SEQUENCE IF NOT EXISTS fetch_run_ids START 1;

CREATE TABLE IF NOT EXISTS fetch_runs (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('fetch_run_ids'),
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    symbols_processed   INTEGER DEFAULT 0,
    bars_inserted       INTEGER DEFAULT 0,
    dividends_inserted  INTEGER DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_bars_date      ON daily_bars (date);
CREATE INDEX IF NOT EXISTS idx_dividends_date ON dividends (date);
"#;

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    /// Second handle on the same database for another thread.
    #[cfg(test)]
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self { conn: self.conn.try_clone()? })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn.execute_batch(INDEXES).context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Symbols ───────────────────────────────────────────────────────────────

    pub fn upsert_symbols(&self, symbols: &[StockSymbol]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for s in symbols {
            tx.execute(
                r#"INSERT INTO symbols (symbol, name, exchange, exchange_short_name, price, kind, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (symbol) DO UPDATE SET
                       name                = COALESCE(excluded.name,                symbols.name),
                       exchange            = COALESCE(excluded.exchange,            symbols.exchange),
                       exchange_short_name = COALESCE(excluded.exchange_short_name, symbols.exchange_short_name),
                       price               = COALESCE(excluded.price,               symbols.price),
                       kind                = COALESCE(excluded.kind,                symbols.kind),
                       updated_at          = excluded.updated_at"#,
                params![
                    s.symbol, s.name, s.exchange, s.exchange_short_name,
                    s.price, s.kind, s.updated_at,
                ],
            ).with_context(|| format!("upsert symbol {}", s.symbol))?;
        }
        tx.commit()?;
        Ok(symbols.len())
    }

    /// Every symbol known either from the listing or from stored bars.
    pub fn list_symbols(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol FROM symbols UNION SELECT DISTINCT symbol FROM daily_bars ORDER BY 1",
        )?;
        let syms = stmt
            .query_map([], |r| r.get(0))?
            .collect::<duckdb::Result<Vec<String>>>()?;
        Ok(syms)
    }

    // ── Daily bars ────────────────────────────────────────────────────────────

    /// Insert bars, leaving existing (symbol, date) rows untouched so that
    /// re-ingestion never undoes an applied adjustment.
    pub fn insert_daily_bars(&self, bars: &[DailyBar]) -> Result<usize> {
        if bars.is_empty() { return Ok(0); }

        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO daily_bars
                (symbol, date, open, high, low, close, adj_close, volume,
                 unadjusted_volume, change, change_pct, vwap, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol, date) DO NOTHING
        "#;

        let mut inserted = 0usize;
        for bar in bars {
            inserted += tx.execute(sql, params![
                bar.symbol, bar.date,
                bar.open, bar.high, bar.low,
                bar.close, bar.adj_close,
                bar.volume, bar.unadjusted_volume,
                bar.change, bar.change_pct, bar.vwap,
                bar.fetched_at,
            ]).with_context(|| format!("insert bar {} {}", bar.symbol, bar.date))?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Re-apply upstream OHLCV to stored bars and insert the ones not yet
    /// stored. `adj_close` and `event_signature` of existing rows are kept so
    /// applied adjustments survive. Returns `(inserted, updated)`.
    pub fn refresh_daily_bars(&self, bars: &[DailyBar]) -> Result<(usize, usize)> {
        if bars.is_empty() { return Ok((0, 0)); }

        let tx = self.conn.unchecked_transaction()?;
        let update = r#"
            UPDATE daily_bars SET
                open = ?, high = ?, low = ?, close = ?,
                volume = ?, unadjusted_volume = ?,
                change = ?, change_pct = ?, vwap = ?, fetched_at = ?
            WHERE symbol = ? AND date = ?
        "#;
        let insert = r#"
            INSERT INTO daily_bars
                (symbol, date, open, high, low, close, adj_close, volume,
                 unadjusted_volume, change, change_pct, vwap, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#;

        let (mut inserted, mut updated) = (0usize, 0usize);
        for bar in bars {
            let n = tx.execute(update, params![
                bar.open, bar.high, bar.low, bar.close,
                bar.volume, bar.unadjusted_volume,
                bar.change, bar.change_pct, bar.vwap, bar.fetched_at,
                bar.symbol, bar.date,
            ]).with_context(|| format!("refresh bar {} {}", bar.symbol, bar.date))?;

            if n > 0 {
                updated += n;
                continue;
            }
            inserted += tx.execute(insert, params![
                bar.symbol, bar.date,
                bar.open, bar.high, bar.low,
                bar.close, bar.adj_close,
                bar.volume, bar.unadjusted_volume,
                bar.change, bar.change_pct, bar.vwap,
                bar.fetched_at,
            ]).with_context(|| format!("insert bar {} {}", bar.symbol, bar.date))?;
        }

        tx.commit()?;
        Ok((inserted, updated))
    }

    /// Full series for one symbol, oldest first.
    pub fn price_series(&self, symbol: &str) -> Result<Vec<PriceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, date, close, adj_close, event_signature
             FROM daily_bars WHERE symbol = ? ORDER BY date",
        )?;
        let rows = stmt
            .query_map(params![symbol], prices::price_record)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn bar_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM daily_bars")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn symbol_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(DISTINCT symbol) FROM daily_bars")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let mut s = self.conn.prepare("SELECT MIN(date), MAX(date) FROM daily_bars")?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    // ── Dividends ─────────────────────────────────────────────────────────────

    pub fn insert_dividends(&self, dividends: &[Dividend]) -> Result<usize> {
        if dividends.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO dividends
                (symbol, date, dividend, adj_dividend, record_date,
                 payment_date, declaration_date, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol, date) DO NOTHING
        "#;

        let mut inserted = 0usize;
        for d in dividends {
            inserted += tx
                .execute(
                    sql,
                    params![
                        d.symbol,
                        d.date,
                        d.dividend,
                        d.adj_dividend,
                        d.record_date,
                        d.payment_date,
                        d.declaration_date,
                        d.fetched_at,
                    ],
                )
                .with_context(|| format!("insert dividend {} {}", d.symbol, d.date))?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// First declared dividend strictly after `date`.
    pub fn next_dividend_after(&self, symbol: &str, date: NaiveDate) -> Result<Option<Dividend>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT symbol, date, dividend, adj_dividend, record_date,
                      payment_date, declaration_date, fetched_at
               FROM dividends
               WHERE symbol = ? AND date > ?
               ORDER BY date
               LIMIT 1"#,
        )?;
        let mut rows = stmt.query_map(params![symbol, date], |r| {
            Ok(Dividend {
                symbol: r.get(0)?,
                date: r.get(1)?,
                dividend: r.get(2)?,
                adj_dividend: r.get(3)?,
                record_date: r.get(4)?,
                payment_date: r.get(5)?,
                declaration_date: r.get(6)?,
                fetched_at: r.get(7)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn dividend_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM dividends")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Adjustment ledger ─────────────────────────────────────────────────────

    pub fn list_adjustment_events(&self, symbol: Option<&str>) -> Result<Vec<AdjustmentRecord>> {
        let base = r#"SELECT symbol, signature, event_date, amount, detachment_close,
                             ratio, rows_adjusted, applied_at
                      FROM adjustment_events"#;
        let map = |r: &duckdb::Row<'_>| -> duckdb::Result<AdjustmentRecord> {
            Ok(AdjustmentRecord {
                symbol: r.get(0)?,
                signature: r.get(1)?,
                event_date: r.get(2)?,
                amount: r.get(3)?,
                detachment_close: r.get(4)?,
                ratio: r.get(5)?,
                rows_adjusted: r.get(6)?,
                applied_at: r.get(7)?,
            })
        };

        let rows = match symbol {
            Some(sym) => self
                .conn
                .prepare(&format!("{base} WHERE symbol = ? ORDER BY event_date"))?
                .query_map(params![sym], map)?
                .collect::<duckdb::Result<Vec<_>>>()?,
            None => self
                .conn
                .prepare(&format!("{base} ORDER BY symbol, event_date"))?
                .query_map([], map)?
                .collect::<duckdb::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    // ── Fetch run log ─────────────────────────────────────────────────────────

    pub fn begin_fetch_run(&self) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO fetch_runs (started_at, status) VALUES (?, 'running') RETURNING id",
            params![Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_fetch_run(
        &self,
        run_id: i64,
        symbols: usize,
        bars: usize,
        dividends: usize,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"UPDATE fetch_runs SET
               finished_at = ?, status = ?,
               symbols_processed = ?, bars_inserted = ?, dividends_inserted = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                symbols as i64, bars as i64, dividends as i64, error, run_id,
            ],
        )?;
        Ok(())
    }

    pub fn fetch_run_status(&self, run_id: i64) -> Result<String> {
        let status = self.conn.query_row(
            "SELECT status FROM fetch_runs WHERE id = ?",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(status)
    }
}
