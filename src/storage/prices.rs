//! DuckDB side of the adjustment engine's price store.

use super::Repository;
use crate::adjust::{PriceStore, PriceTx, Result};
use crate::models::{AdjustmentRecord, PriceRecord};
use chrono::NaiveDate;
use duckdb::{params, Connection, Row};
use tracing::warn;

pub(super) fn price_record(r: &Row<'_>) -> duckdb::Result<PriceRecord> {
    Ok(PriceRecord {
        symbol: r.get(0)?,
        date: r.get(1)?,
        close: r.get(2)?,
        adjusted_close: r.get(3)?,
        event_signature: r.get(4)?,
    })
}

impl PriceStore for Repository {
    fn has_signature(&self, symbol: &str, signature: &str) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM daily_bars WHERE symbol = ? AND event_signature = ?",
            params![symbol, signature],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    fn instruments(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT symbol FROM daily_bars ORDER BY symbol")?;
        let syms = stmt
            .query_map([], |r| r.get(0))?
            .collect::<duckdb::Result<Vec<String>>>()?;
        Ok(syms)
    }

    fn latest_divergence(
        &self,
        symbol: &str,
        since: NaiveDate,
        min_gap: f64,
    ) -> Result<Option<PriceRecord>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT symbol, date, close, adj_close, event_signature
               FROM daily_bars
               WHERE symbol = ?
                 AND date > ?
                 AND event_signature IS NULL
                 AND ABS(close - adj_close) >= ?
                 AND date > COALESCE(
                     (SELECT MAX(date) FROM daily_bars
                      WHERE symbol = ? AND event_signature IS NOT NULL),
                     DATE '0001-01-01')
               ORDER BY date DESC
               LIMIT 1"#,
        )?;
        let mut rows = stmt.query_map(params![symbol, since, min_gap, symbol], price_record)?;
        Ok(rows.next().transpose()?)
    }

    fn atomically<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn PriceTx) -> Result<T>,
    {
        let tx = self.conn.unchecked_transaction()?;
        match f(&*tx) {
            Ok(out) => {
                tx.commit()?;
                Ok(out)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback() {
                    warn!("Rollback failed after {}: {}", e, rb);
                }
                Err(e)
            }
        }
    }
}

impl PriceTx for Connection {
    fn ledger_contains(&self, symbol: &str, signature: &str) -> Result<bool> {
        let n: i64 = self.query_row(
            "SELECT COUNT(*) FROM adjustment_events WHERE symbol = ? AND signature = ?",
            params![symbol, signature],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    fn price_at(&self, symbol: &str, date: NaiveDate) -> Result<Option<PriceRecord>> {
        let mut stmt = self.prepare(
            "SELECT symbol, date, close, adj_close, event_signature
             FROM daily_bars WHERE symbol = ? AND date = ?",
        )?;
        let mut rows = stmt.query_map(params![symbol, date], price_record)?;
        Ok(rows.next().transpose()?)
    }

    fn stamp_signature(&self, symbol: &str, date: NaiveDate, signature: &str) -> Result<usize> {
        Ok(self.execute(
            "UPDATE daily_bars SET event_signature = ? WHERE symbol = ? AND date = ?",
            params![signature, symbol, date],
        )?)
    }

    fn rescale_before(&self, symbol: &str, date: NaiveDate, factor: f64) -> Result<usize> {
        Ok(self.execute(
            "UPDATE daily_bars SET adj_close = close * ? WHERE symbol = ? AND date < ?",
            params![factor, symbol, date],
        )?)
    }

    fn record_adjustment(&self, record: &AdjustmentRecord) -> Result<()> {
        self.execute(
            r#"INSERT INTO adjustment_events
                   (symbol, signature, event_date, amount, detachment_close,
                    ratio, rows_adjusted, applied_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                record.symbol,
                record.signature,
                record.event_date,
                record.amount,
                record.detachment_close,
                record.ratio,
                record.rows_adjusted,
                record.applied_at,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{bar, date, seeded};
    use super::*;
    use crate::adjust::AdjustError;
    use chrono::Utc;

    fn record(sig: &str) -> AdjustmentRecord {
        AdjustmentRecord {
            symbol: "X".into(),
            signature: sig.into(),
            event_date: date("2024-01-03"),
            amount: 1.0,
            detachment_close: 50.0,
            ratio: 0.02,
            rows_adjusted: 2,
            applied_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn test_ledger_rejects_duplicate_signature() {
        let repo = seeded(&[bar("X", "2024-01-03", 50.0, 50.0)]);
        repo.atomically(|tx| tx.record_adjustment(&record("abc"))).unwrap();

        let dup = repo.atomically(|tx| tx.record_adjustment(&record("abc")));
        assert!(matches!(dup, Err(AdjustError::Persistence(_))));
        assert_eq!(repo.list_adjustment_events(Some("X")).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_scope_rolls_back_every_write() {
        let repo = seeded(&[
            bar("X", "2024-01-01", 50.0, 50.0),
            bar("X", "2024-01-03", 50.0, 50.0),
        ]);
        let before = repo.price_series("X").unwrap();

        let out: Result<()> = repo.atomically(|tx| {
            tx.stamp_signature("X", date("2024-01-03"), "abc")?;
            tx.rescale_before("X", date("2024-01-03"), 0.5)?;
            tx.record_adjustment(&record("abc"))?;
            Err(AdjustError::MissingPriceData {
                symbol: "X".into(),
                date: date("2024-01-03"),
            })
        });

        assert!(out.is_err());
        assert_eq!(repo.price_series("X").unwrap(), before);
        assert!(repo.list_adjustment_events(None).unwrap().is_empty());
        assert!(!repo.has_signature("X", "abc").unwrap());
    }

    #[test]
    fn test_clone_shares_database() {
        let repo = seeded(&[bar("X", "2024-01-01", 1.0, 1.0)]);
        let other = repo.try_clone().unwrap();
        assert_eq!(other.instruments().unwrap(), vec!["X"]);
    }
}
