//! Company profiles, key metrics and index membership.

use super::Repository;
use crate::models::{CompanyProfile, IndexComponent, KeyMetrics};
use anyhow::{Context, Result};
use duckdb::{params, Row};

fn company_profile(r: &Row<'_>) -> duckdb::Result<CompanyProfile> {
    Ok(CompanyProfile {
        symbol: r.get(0)?,
        company_name: r.get(1)?,
        currency: r.get(2)?,
        exchange_short_name: r.get(3)?,
        cik: r.get(4)?,
        isin: r.get(5)?,
        cusip: r.get(6)?,
        industry: r.get(7)?,
        sector: r.get(8)?,
        country: r.get(9)?,
        website: r.get(10)?,
        description: r.get(11)?,
        ceo: r.get(12)?,
        image: r.get(13)?,
        ipo_date: r.get(14)?,
        beta: r.get(15)?,
        vol_avg: r.get(16)?,
        mkt_cap: r.get(17)?,
        is_etf: r.get(18)?,
        is_actively_trading: r.get(19)?,
        is_adr: r.get(20)?,
        is_fund: r.get(21)?,
        updated_at: r.get(22)?,
    })
}

fn index_component(r: &Row<'_>) -> duckdb::Result<IndexComponent> {
    Ok(IndexComponent {
        index_symbol: r.get(0)?,
        symbol: r.get(1)?,
        as_of: r.get(2)?,
        index_name: r.get(3)?,
        index_isin: r.get(4)?,
        isin: r.get(5)?,
        rank: r.get(6)?,
        sector: r.get(7)?,
        date_first_added: r.get(8)?,
        fetched_at: r.get(9)?,
    })
}

impl Repository {
    // ── Company profiles ──────────────────────────────────────────────────────

    /// Profiles are snapshots: the latest fetch replaces the stored one.
    pub fn upsert_company_profiles(&self, profiles: &[CompanyProfile]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for p in profiles {
            tx.execute(
                r#"INSERT INTO company_profiles
                       (symbol, company_name, currency, exchange_short_name, cik, isin, cusip,
                        industry, sector, country, website, description, ceo, image, ipo_date,
                        beta, vol_avg, mkt_cap, is_etf, is_actively_trading, is_adr, is_fund,
                        updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (symbol) DO UPDATE SET
                       company_name        = excluded.company_name,
                       currency            = excluded.currency,
                       exchange_short_name = excluded.exchange_short_name,
                       cik                 = excluded.cik,
                       isin                = excluded.isin,
                       cusip               = excluded.cusip,
                       industry            = excluded.industry,
                       sector              = excluded.sector,
                       country             = excluded.country,
                       website             = excluded.website,
                       description         = excluded.description,
                       ceo                 = excluded.ceo,
                       image               = excluded.image,
                       ipo_date            = excluded.ipo_date,
                       beta                = excluded.beta,
                       vol_avg             = excluded.vol_avg,
                       mkt_cap             = excluded.mkt_cap,
                       is_etf              = excluded.is_etf,
                       is_actively_trading = excluded.is_actively_trading,
                       is_adr              = excluded.is_adr,
                       is_fund             = excluded.is_fund,
                       updated_at          = excluded.updated_at"#,
                params![
                    p.symbol, p.company_name, p.currency, p.exchange_short_name,
                    p.cik, p.isin, p.cusip, p.industry, p.sector, p.country,
                    p.website, p.description, p.ceo, p.image, p.ipo_date,
                    p.beta, p.vol_avg, p.mkt_cap,
                    p.is_etf, p.is_actively_trading, p.is_adr, p.is_fund,
                    p.updated_at,
                ],
            ).with_context(|| format!("upsert profile {}", p.symbol))?;
        }
        tx.commit()?;
        Ok(profiles.len())
    }

    pub fn company_profile(&self, symbol: &str) -> Result<Option<CompanyProfile>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT symbol, company_name, currency, exchange_short_name, cik, isin, cusip,
                      industry, sector, country, website, description, ceo, image, ipo_date,
                      beta, vol_avg, mkt_cap, is_etf, is_actively_trading, is_adr, is_fund,
                      updated_at
               FROM company_profiles WHERE symbol = ?"#,
        )?;
        let mut rows = stmt.query_map(params![symbol], company_profile)?;
        Ok(rows.next().transpose()?)
    }

    /// The listing that best represents `isin`: actively traded, highest
    /// average volume.
    pub fn symbol_for_isin(&self, isin: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT symbol FROM company_profiles
               WHERE isin = ? AND COALESCE(is_actively_trading, TRUE)
               ORDER BY vol_avg DESC NULLS LAST, symbol
               LIMIT 1"#,
        )?;
        let mut rows = stmt.query_map(params![isin], |r| r.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn profile_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM company_profiles")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Key metrics ───────────────────────────────────────────────────────────

    /// Existing (symbol, date) rows are left as they are.
    pub fn insert_key_metrics(&self, metrics: &[KeyMetrics]) -> Result<usize> {
        if metrics.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO key_metrics
                (symbol, date, calendar_year, period,
                 revenue_per_share, net_income_per_share, operating_cash_flow_per_share,
                 free_cash_flow_per_share, cash_per_share, book_value_per_share,
                 market_cap, enterprise_value, pe_ratio, price_to_sales_ratio, pb_ratio,
                 ev_to_sales, ev_to_ebitda, earnings_yield, free_cash_flow_yield,
                 debt_to_equity, debt_to_assets, current_ratio, dividend_yield,
                 payout_ratio, roic, roe, extra, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol, date) DO NOTHING
        "#;

        let mut inserted = 0usize;
        for m in metrics {
            inserted += tx.execute(sql, params![
                m.symbol, m.date, m.calendar_year, m.period,
                m.revenue_per_share, m.net_income_per_share, m.operating_cash_flow_per_share,
                m.free_cash_flow_per_share, m.cash_per_share, m.book_value_per_share,
                m.market_cap, m.enterprise_value, m.pe_ratio, m.price_to_sales_ratio, m.pb_ratio,
                m.ev_to_sales, m.ev_to_ebitda, m.earnings_yield, m.free_cash_flow_yield,
                m.debt_to_equity, m.debt_to_assets, m.current_ratio, m.dividend_yield,
                m.payout_ratio, m.roic, m.roe, m.extra, m.fetched_at,
            ]).with_context(|| format!("insert key metrics {} {}", m.symbol, m.date))?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    pub fn key_metric_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM key_metrics")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Index membership ──────────────────────────────────────────────────────

    pub fn insert_index_components(&self, components: &[IndexComponent]) -> Result<usize> {
        if components.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO index_components
                (index_symbol, symbol, as_of, index_name, index_isin, isin,
                 index_rank, sector, date_first_added, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (index_symbol, symbol, as_of) DO NOTHING
        "#;

        let mut inserted = 0usize;
        for c in components {
            inserted += tx.execute(sql, params![
                c.index_symbol, c.symbol, c.as_of, c.index_name, c.index_isin, c.isin,
                c.rank, c.sector, c.date_first_added, c.fetched_at,
            ]).with_context(|| format!("insert {} member {}", c.index_symbol, c.symbol))?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Members at the most recent `as_of` stored for the index, by rank then symbol.
    pub fn index_members(&self, index_symbol: &str) -> Result<Vec<IndexComponent>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT index_symbol, symbol, as_of, index_name, index_isin, isin,
                      index_rank, sector, date_first_added, fetched_at
               FROM index_components
               WHERE index_symbol = ?
                 AND as_of = (SELECT MAX(as_of) FROM index_components WHERE index_symbol = ?)
               ORDER BY index_rank NULLS LAST, symbol"#,
        )?;
        let rows = stmt
            .query_map(params![index_symbol, index_symbol], index_component)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn index_component_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM index_components")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{date, seeded};
    use super::*;
    use chrono::Utc;

    fn profile(symbol: &str, isin: &str, vol_avg: f64, active: bool) -> CompanyProfile {
        CompanyProfile {
            symbol: symbol.into(),
            company_name: Some(format!("{symbol} Inc")),
            currency: Some("EUR".into()),
            exchange_short_name: None,
            cik: None,
            isin: Some(isin.into()),
            cusip: None,
            industry: None,
            sector: Some("Energy".into()),
            country: Some("FR".into()),
            website: None,
            description: None,
            ceo: None,
            image: None,
            ipo_date: Some(date("1990-01-02")),
            beta: Some(0.9),
            vol_avg: Some(vol_avg),
            mkt_cap: Some(1.0e11),
            is_etf: Some(false),
            is_actively_trading: Some(active),
            is_adr: Some(false),
            is_fund: Some(false),
            updated_at: Utc::now().naive_utc(),
        }
    }

    fn component(index: &str, symbol: &str, as_of: &str, rank: i32) -> IndexComponent {
        IndexComponent {
            index_symbol: index.into(),
            symbol: symbol.into(),
            as_of: date(as_of),
            index_name: None,
            index_isin: None,
            isin: None,
            rank: Some(rank),
            sector: None,
            date_first_added: None,
            fetched_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn test_profile_upsert_and_isin_lookup() {
        let repo = seeded(&[]);
        repo.upsert_company_profiles(&[
            profile("TTE.PA", "FR0000120271", 5.0e6, true),
            profile("TTE", "FR0000120271", 1.0e6, true),
            profile("TOTB.DE", "FR0000120271", 9.0e6, false),
        ])
        .unwrap();

        assert_eq!(repo.symbol_for_isin("FR0000120271").unwrap().as_deref(), Some("TTE.PA"));
        assert_eq!(repo.symbol_for_isin("XX0000000000").unwrap(), None);

        let mut newer = profile("TTE.PA", "FR0000120271", 5.0e6, true);
        newer.mkt_cap = Some(1.5e11);
        repo.upsert_company_profiles(&[newer]).unwrap();

        let stored = repo.company_profile("TTE.PA").unwrap().unwrap();
        assert_eq!(stored.mkt_cap, Some(1.5e11));
        assert_eq!(stored.ipo_date, Some(date("1990-01-02")));
        assert_eq!(repo.profile_count().unwrap(), 3);
    }

    #[test]
    fn test_key_metrics_insert_is_idempotent() {
        let repo = seeded(&[]);
        let metrics = KeyMetrics {
            symbol: "AAPL".into(),
            date: date("2023-12-30"),
            calendar_year: Some("2024".into()),
            period: Some("Q1".into()),
            revenue_per_share: Some(7.68),
            net_income_per_share: None,
            operating_cash_flow_per_share: None,
            free_cash_flow_per_share: None,
            cash_per_share: None,
            book_value_per_share: None,
            market_cap: Some(2.9e12),
            enterprise_value: None,
            pe_ratio: Some(28.1),
            price_to_sales_ratio: None,
            pb_ratio: None,
            ev_to_sales: None,
            ev_to_ebitda: None,
            earnings_yield: None,
            free_cash_flow_yield: None,
            debt_to_equity: None,
            debt_to_assets: None,
            current_ratio: None,
            dividend_yield: None,
            payout_ratio: None,
            roic: None,
            roe: None,
            extra: Some(r#"{"grahamNumber":24.9}"#.into()),
            fetched_at: Utc::now().naive_utc(),
        };

        repo.insert_key_metrics(&[metrics.clone()]).unwrap();
        repo.insert_key_metrics(&[metrics]).unwrap();
        assert_eq!(repo.key_metric_count().unwrap(), 1);
    }

    #[test]
    fn test_index_members_latest_snapshot() {
        let repo = seeded(&[]);
        repo.insert_index_components(&[
            component("SXXP", "NESN.SW", "2024-02-01", 1),
            component("SXXP", "ASML.AS", "2024-03-01", 2),
            component("SXXP", "NOVO-B.CO", "2024-03-01", 1),
            component("SP500", "MSFT", "2024-03-01", 1),
        ])
        .unwrap();
        repo.insert_index_components(&[component("SXXP", "ASML.AS", "2024-03-01", 2)])
            .unwrap();

        let members: Vec<_> = repo
            .index_members("SXXP")
            .unwrap()
            .into_iter()
            .map(|c| c.symbol)
            .collect();
        assert_eq!(members, vec!["NOVO-B.CO", "ASML.AS"]);
        assert_eq!(repo.index_component_count().unwrap(), 4);
    }
}
