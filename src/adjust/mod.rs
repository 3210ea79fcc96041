//! Dividend back-adjustment of stored adjusted-close series.
//!
//! [`AdjustmentEngine::apply_dividend_adjustment`] anchors an event on the
//! close of its detachment day, derives one corrective ratio from it and
//! rewrites `adj_close = close * (1 - ratio)` for every earlier bar of the
//! instrument in a single set-based update. The detachment row is stamped
//! with the event signature, and the whole operation runs in one store
//! transaction together with a ledger insert keyed on that signature, so an
//! event is applied at most once no matter how often it is replayed.
//!
//! The event day's own `adj_close` is left alone: its close is expected to
//! already reflect the detachment.
//!
//! [`AdjustmentEngine::find_undeclared_events`] is the read-only side: it
//! walks instruments lazily and reports the latest divergence between close
//! and adjusted close that no signed event explains.

pub mod finder;
pub mod signature;

use crate::config::AdjustmentConfig;
use crate::models::{AdjustmentRecord, CorporateEvent, PriceRecord};
use crate::utils::normalise_symbol;
use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, info};

pub use self::finder::UndeclaredEvents;
pub use self::signature::signature_of;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AdjustError {
    #[error("invalid dividend amount {amount}: expected a positive, finite number")]
    InvalidAmount { amount: f64 },

    #[error("no close price for {symbol} on {date}")]
    MissingPriceData { symbol: String, date: NaiveDate },

    #[error("cannot derive a corrective ratio for {symbol} on {date} (close {close}, amount {amount})")]
    InvalidRatio {
        symbol: String,
        date: NaiveDate,
        close: f64,
        amount: f64,
    },

    #[error("storage failure: {0}")]
    Persistence(#[from] duckdb::Error),
}

pub type Result<T> = std::result::Result<T, AdjustError>;

/// Outcome of a successful call. Replays are not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum AdjustmentStatus {
    Applied { rows_adjusted: usize, ratio: f64 },
    AlreadyApplied,
}

// ── Store seams ───────────────────────────────────────────────────────────────

/// Read side of a price-series store plus transaction scoping.
pub trait PriceStore {
    /// Whether any bar of `symbol` already carries `signature`.
    fn has_signature(&self, symbol: &str, signature: &str) -> Result<bool>;

    /// Instruments that have at least one bar, in a stable order.
    fn instruments(&self) -> Result<Vec<String>>;

    /// Most recent unsigned bar after `since` whose close and adjusted close
    /// differ by at least `min_gap`, ignoring bars on or before the latest
    /// signed event of the instrument.
    fn latest_divergence(
        &self,
        symbol: &str,
        since: NaiveDate,
        min_gap: f64,
    ) -> Result<Option<PriceRecord>>;

    /// Run `f` in one transaction: commit on `Ok`, roll back on `Err`.
    fn atomically<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn PriceTx) -> Result<T>;
}

/// Writes available inside [`PriceStore::atomically`].
pub trait PriceTx {
    fn ledger_contains(&self, symbol: &str, signature: &str) -> Result<bool>;

    fn price_at(&self, symbol: &str, date: NaiveDate) -> Result<Option<PriceRecord>>;

    fn stamp_signature(&self, symbol: &str, date: NaiveDate, signature: &str) -> Result<usize>;

    /// `adj_close = close * factor` for every bar of `symbol` before `date`.
    fn rescale_before(&self, symbol: &str, date: NaiveDate, factor: f64) -> Result<usize>;

    /// Must fail if `(symbol, signature)` is already recorded.
    fn record_adjustment(&self, record: &AdjustmentRecord) -> Result<()>;
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct AdjustmentEngine<'s, S: PriceStore> {
    store: &'s S,
    config: AdjustmentConfig,
}

impl<'s, S: PriceStore> AdjustmentEngine<'s, S> {
    pub fn new(store: &'s S, config: AdjustmentConfig) -> Self {
        Self { store, config }
    }

    pub fn apply_dividend_adjustment(
        &self,
        symbol: &str,
        event_date: NaiveDate,
        amount: f64,
    ) -> Result<AdjustmentStatus> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(AdjustError::InvalidAmount { amount });
        }

        let event = CorporateEvent {
            symbol: normalise_symbol(symbol),
            event_date,
            amount,
        };
        let signature = signature_of(&event.symbol, event.event_date, event.amount);

        if self.store.has_signature(&event.symbol, &signature)? {
            info!("{} {}: dividend {} already applied", event.symbol, event_date, amount);
            return Ok(AdjustmentStatus::AlreadyApplied);
        }

        let status = self.store.atomically(|tx| apply_in(tx, &event, &signature))?;

        match &status {
            AdjustmentStatus::Applied { rows_adjusted, ratio } => info!(
                "{} {}: dividend {} applied (ratio {:.6}, {} prior bars rewritten)",
                event.symbol, event_date, amount, ratio, rows_adjusted
            ),
            AdjustmentStatus::AlreadyApplied => info!(
                "{} {}: dividend {} recorded concurrently, nothing written",
                event.symbol, event_date, amount
            ),
        }
        Ok(status)
    }

    /// Lazily scan every instrument for unexplained close/adj_close gaps
    /// dated after `since`.
    pub fn find_undeclared_events(&self, since: NaiveDate) -> UndeclaredEvents<'s, S> {
        UndeclaredEvents::new(self.store, since, self.config.amount_precision)
    }
}

fn apply_in(tx: &dyn PriceTx, event: &CorporateEvent, signature: &str) -> Result<AdjustmentStatus> {
    if tx.ledger_contains(&event.symbol, signature)? {
        return Ok(AdjustmentStatus::AlreadyApplied);
    }

    let anchor = tx
        .price_at(&event.symbol, event.event_date)?
        .ok_or_else(|| AdjustError::MissingPriceData {
            symbol: event.symbol.clone(),
            date: event.event_date,
        })?;

    let ratio = corrective_ratio(event, anchor.close)?;
    debug!(
        "{} {}: detachment close {}, ratio {}",
        event.symbol, event.event_date, anchor.close, ratio
    );

    tx.stamp_signature(&event.symbol, event.event_date, signature)?;
    let rows_adjusted = tx.rescale_before(&event.symbol, event.event_date, 1.0 - ratio)?;

    tx.record_adjustment(&AdjustmentRecord {
        symbol: event.symbol.clone(),
        signature: signature.to_string(),
        event_date: event.event_date,
        amount: event.amount,
        detachment_close: anchor.close,
        ratio,
        rows_adjusted: rows_adjusted as i64,
        applied_at: Utc::now().naive_utc(),
    })?;

    Ok(AdjustmentStatus::Applied { rows_adjusted, ratio })
}

/// `amount / close`, kept inside (0, 1) so adjusted prices stay positive.
fn corrective_ratio(event: &CorporateEvent, close: f64) -> Result<f64> {
    let ratio = event.amount / close;
    if !close.is_finite() || close <= 0.0 || !ratio.is_finite() || ratio >= 1.0 {
        return Err(AdjustError::InvalidRatio {
            symbol: event.symbol.clone(),
            date: event.event_date,
            close,
            amount: event.amount,
        });
    }
    Ok(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Repository;
    use crate::storage::test_support::{bar, date, seeded};
    use std::sync::Barrier;
    use std::thread;

    fn engine(repo: &Repository) -> AdjustmentEngine<'_, Repository> {
        AdjustmentEngine::new(repo, AdjustmentConfig::default())
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn five_day_series() -> Repository {
        seeded(&[
            bar("X", "2024-01-01", 50.0, 50.0),
            bar("X", "2024-01-02", 50.0, 50.0),
            bar("X", "2024-01-03", 50.0, 50.0),
            bar("X", "2024-01-04", 50.0, 50.0),
            bar("X", "2024-01-05", 52.0, 52.0),
        ])
    }

    #[test]
    fn test_end_to_end_dividend_scenario() {
        let repo = five_day_series();
        let engine = engine(&repo);

        let status = engine
            .apply_dividend_adjustment("X", date("2024-01-05"), 2.0)
            .unwrap();
        let ratio = 2.0 / 52.0;
        assert_eq!(status, AdjustmentStatus::Applied { rows_adjusted: 4, ratio });

        let series = repo.price_series("X").unwrap();
        for rec in &series[..4] {
            assert_close(rec.adjusted_close, 50.0 * (1.0 - ratio));
            assert!((rec.adjusted_close - 48.08).abs() < 0.01);
            assert_eq!(rec.event_signature, None);
        }
        let anchor = &series[4];
        assert_eq!(anchor.adjusted_close, 52.0);
        assert_eq!(
            anchor.event_signature.as_deref(),
            Some(signature_of("X", date("2024-01-05"), 2.0).as_str())
        );

        let again = engine
            .apply_dividend_adjustment("X", date("2024-01-05"), 2.0)
            .unwrap();
        assert_eq!(again, AdjustmentStatus::AlreadyApplied);
        assert_eq!(repo.price_series("X").unwrap(), series);
        assert_eq!(repo.list_adjustment_events(Some("X")).unwrap().len(), 1);
    }

    #[test]
    fn test_ratio_applied_to_raw_close() {
        let repo = seeded(&[
            bar("ACME", "2024-03-01", 80.0, 80.0),
            bar("ACME", "2024-03-04", 90.0, 90.0),
            bar("ACME", "2024-03-05", 100.0, 100.0),
        ]);

        engine(&repo)
            .apply_dividend_adjustment("ACME", date("2024-03-05"), 5.0)
            .unwrap();

        let series = repo.price_series("ACME").unwrap();
        assert_close(series[0].adjusted_close, 80.0 * 0.95);
        assert_close(series[1].adjusted_close, 90.0 * 0.95);
        assert_close(series[2].adjusted_close, 100.0);
    }

    #[test]
    fn test_symbol_is_normalised() {
        let repo = five_day_series();
        let engine = engine(&repo);

        assert!(matches!(
            engine.apply_dividend_adjustment(" x ", date("2024-01-05"), 2.0),
            Ok(AdjustmentStatus::Applied { .. })
        ));
        assert_eq!(
            engine.apply_dividend_adjustment("X", date("2024-01-05"), 2.0).unwrap(),
            AdjustmentStatus::AlreadyApplied
        );
    }

    #[test]
    fn test_earliest_bar_stamps_without_rewrites() {
        let repo = five_day_series();

        let status = engine(&repo)
            .apply_dividend_adjustment("X", date("2024-01-01"), 1.0)
            .unwrap();

        assert_eq!(
            status,
            AdjustmentStatus::Applied { rows_adjusted: 0, ratio: 1.0 / 50.0 }
        );
        let series = repo.price_series("X").unwrap();
        assert!(series[0].event_signature.is_some());
        assert!(series.iter().all(|r| r.adjusted_close == r.close));
    }

    #[test]
    fn test_missing_anchor_writes_nothing() {
        let repo = five_day_series();
        let before = repo.price_series("X").unwrap();

        let err = engine(&repo)
            .apply_dividend_adjustment("X", date("2024-01-06"), 2.0)
            .unwrap_err();

        assert!(matches!(err, AdjustError::MissingPriceData { ref symbol, date: d }
            if symbol == "X" && d == date("2024-01-06")));
        assert_eq!(repo.price_series("X").unwrap(), before);
        assert!(repo.list_adjustment_events(None).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_amounts() {
        let repo = five_day_series();
        let engine = engine(&repo);

        for amount in [0.0, -1.5, f64::NAN, f64::INFINITY] {
            let err = engine
                .apply_dividend_adjustment("X", date("2024-01-05"), amount)
                .unwrap_err();
            assert!(matches!(err, AdjustError::InvalidAmount { .. }), "{amount}");
        }
        assert!(repo.list_adjustment_events(None).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_degenerate_ratio() {
        let repo = seeded(&[
            bar("Z", "2024-01-01", 10.0, 10.0),
            bar("Z", "2024-01-02", 0.0, 0.0),
            bar("Z", "2024-01-03", 4.0, 4.0),
        ]);
        let engine = engine(&repo);
        let before = repo.price_series("Z").unwrap();

        let zero_close = engine.apply_dividend_adjustment("Z", date("2024-01-02"), 1.0);
        assert!(matches!(zero_close, Err(AdjustError::InvalidRatio { .. })));

        let wipes_price = engine.apply_dividend_adjustment("Z", date("2024-01-03"), 4.0);
        assert!(matches!(wipes_price, Err(AdjustError::InvalidRatio { .. })));

        assert_eq!(repo.price_series("Z").unwrap(), before);
    }

    #[test]
    fn test_distinct_events_each_apply_once() {
        let repo = five_day_series();
        let engine = engine(&repo);

        engine
            .apply_dividend_adjustment("X", date("2024-01-03"), 1.0)
            .unwrap();
        engine
            .apply_dividend_adjustment("X", date("2024-01-05"), 2.0)
            .unwrap();
        assert_eq!(
            engine.apply_dividend_adjustment("X", date("2024-01-03"), 1.0).unwrap(),
            AdjustmentStatus::AlreadyApplied
        );

        let events = repo.list_adjustment_events(Some("X")).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_date, date("2024-01-03"));
        assert_eq!(events[0].rows_adjusted, 2);
        assert_eq!(events[1].rows_adjusted, 4);
    }

    #[test]
    fn test_other_instruments_untouched() {
        let repo = seeded(&[
            bar("X", "2024-01-01", 50.0, 50.0),
            bar("X", "2024-01-02", 52.0, 52.0),
            bar("Y", "2024-01-01", 20.0, 20.0),
            bar("Y", "2024-01-02", 21.0, 21.0),
        ]);
        let y_before = repo.price_series("Y").unwrap();

        engine(&repo)
            .apply_dividend_adjustment("X", date("2024-01-02"), 2.0)
            .unwrap();

        assert_eq!(repo.price_series("Y").unwrap(), y_before);
    }

    #[test]
    fn test_replay_after_foreign_ledger_write_is_noop() {
        let repo = five_day_series();
        let sig = signature_of("X", date("2024-01-05"), 2.0);

        // Another writer recorded the event; the bar itself was never stamped.
        repo.atomically(|tx| {
            tx.record_adjustment(&AdjustmentRecord {
                symbol: "X".into(),
                signature: sig.clone(),
                event_date: date("2024-01-05"),
                amount: 2.0,
                detachment_close: 52.0,
                ratio: 2.0 / 52.0,
                rows_adjusted: 4,
                applied_at: Utc::now().naive_utc(),
            })
        })
        .unwrap();

        let status = engine(&repo)
            .apply_dividend_adjustment("X", date("2024-01-05"), 2.0)
            .unwrap();
        assert_eq!(status, AdjustmentStatus::AlreadyApplied);
        assert!(repo.price_series("X").unwrap().iter().all(|r| r.adjusted_close == r.close));
    }

    /// Delegating store whose transactions meet at `gate` once their ledger
    /// check has run, so two writers race past it together.
    struct Gated<'g> {
        repo: Repository,
        gate: &'g Barrier,
    }

    struct GatedTx<'t> {
        inner: &'t dyn PriceTx,
        gate: &'t Barrier,
    }

    impl PriceStore for Gated<'_> {
        fn has_signature(&self, symbol: &str, signature: &str) -> Result<bool> {
            self.repo.has_signature(symbol, signature)
        }

        fn instruments(&self) -> Result<Vec<String>> {
            self.repo.instruments()
        }

        fn latest_divergence(
            &self,
            symbol: &str,
            since: NaiveDate,
            min_gap: f64,
        ) -> Result<Option<PriceRecord>> {
            self.repo.latest_divergence(symbol, since, min_gap)
        }

        fn atomically<T, F>(&self, f: F) -> Result<T>
        where
            F: FnOnce(&dyn PriceTx) -> Result<T>,
        {
            self.repo.atomically(|tx| f(&GatedTx { inner: tx, gate: self.gate }))
        }
    }

    impl PriceTx for GatedTx<'_> {
        fn ledger_contains(&self, symbol: &str, signature: &str) -> Result<bool> {
            let seen = self.inner.ledger_contains(symbol, signature)?;
            self.gate.wait();
            Ok(seen)
        }

        fn price_at(&self, symbol: &str, date: NaiveDate) -> Result<Option<PriceRecord>> {
            self.inner.price_at(symbol, date)
        }

        fn stamp_signature(&self, symbol: &str, date: NaiveDate, signature: &str) -> Result<usize> {
            self.inner.stamp_signature(symbol, date, signature)
        }

        fn rescale_before(&self, symbol: &str, date: NaiveDate, factor: f64) -> Result<usize> {
            self.inner.rescale_before(symbol, date, factor)
        }

        fn record_adjustment(&self, record: &AdjustmentRecord) -> Result<()> {
            self.inner.record_adjustment(record)
        }
    }

    #[test]
    fn test_concurrent_duplicate_applies_once() {
        let repo = five_day_series();
        let gate = Barrier::new(2);
        let stores = [
            Gated { repo: repo.try_clone().unwrap(), gate: &gate },
            Gated { repo: repo.try_clone().unwrap(), gate: &gate },
        ];

        let outcomes: Vec<Result<AdjustmentStatus>> = thread::scope(|s| {
            let handles: Vec<_> = stores
                .into_iter()
                .map(|store| {
                    s.spawn(move || {
                        AdjustmentEngine::new(&store, AdjustmentConfig::default())
                            .apply_dividend_adjustment("X", date("2024-01-05"), 2.0)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(AdjustmentStatus::Applied { rows_adjusted: 4, .. })))
            .count();
        let conflicted = outcomes
            .iter()
            .filter(|o| matches!(o, Err(AdjustError::Persistence(_))))
            .count();
        assert_eq!((applied, conflicted), (1, 1), "{outcomes:?}");

        assert_eq!(repo.list_adjustment_events(Some("X")).unwrap().len(), 1);
        let series = repo.price_series("X").unwrap();
        for rec in &series[..4] {
            assert_close(rec.adjusted_close, 50.0 * (1.0 - 2.0 / 52.0));
        }
        assert_eq!(series[4].adjusted_close, 52.0);

        assert_eq!(
            engine(&repo).apply_dividend_adjustment("X", date("2024-01-05"), 2.0).unwrap(),
            AdjustmentStatus::AlreadyApplied
        );
    }
}
