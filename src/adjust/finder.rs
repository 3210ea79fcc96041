//! Lazy scan for close/adj_close divergences no signed event explains.

use super::{PriceStore, Result};
use crate::models::UndeclaredEvent;
use crate::utils::round_to;
use chrono::NaiveDate;

/// One query per instrument, issued as the iterator is pulled.
///
/// Yields at most one candidate per instrument: the most recent unsigned
/// divergence after `since`. Older gaps stay hidden until that one is
/// resolved. [`restart`](Self::restart) rewinds to the first instrument and
/// re-reads the instrument list.
pub struct UndeclaredEvents<'s, S: PriceStore> {
    store: &'s S,
    since: NaiveDate,
    precision: u32,
    symbols: Option<Vec<String>>,
    pos: usize,
}

impl<'s, S: PriceStore> UndeclaredEvents<'s, S> {
    pub fn new(store: &'s S, since: NaiveDate, precision: u32) -> Self {
        Self {
            store,
            since,
            precision,
            symbols: None,
            pos: 0,
        }
    }

    pub fn restart(&mut self) {
        self.symbols = None;
        self.pos = 0;
    }

    /// Smallest gap that survives rounding to `precision` places.
    fn min_gap(&self) -> f64 {
        0.5 / 10f64.powi(self.precision as i32)
    }
}

impl<S: PriceStore> Iterator for UndeclaredEvents<'_, S> {
    type Item = Result<UndeclaredEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.symbols.is_none() {
            match self.store.instruments() {
                Ok(symbols) => self.symbols = Some(symbols),
                Err(e) => {
                    self.symbols = Some(Vec::new());
                    return Some(Err(e));
                }
            }
        }

        loop {
            let symbol = self.symbols.as_ref()?.get(self.pos)?.clone();
            self.pos += 1;

            match self.store.latest_divergence(&symbol, self.since, self.min_gap()) {
                Ok(Some(rec)) => {
                    return Some(Ok(UndeclaredEvent {
                        symbol,
                        date: rec.date,
                        implied_amount: round_to(rec.close - rec.adjusted_close, self.precision),
                    }));
                }
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::adjust::AdjustmentEngine;
    use crate::config::AdjustmentConfig;
    use crate::models::UndeclaredEvent;
    use crate::storage::test_support::{bar, date, seeded};

    fn scan(repo: &crate::storage::Repository, since: &str) -> Vec<UndeclaredEvent> {
        AdjustmentEngine::new(repo, AdjustmentConfig::default())
            .find_undeclared_events(date(since))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_single_divergence_is_reported() {
        let repo = seeded(&[
            bar("X", "2024-01-01", 100.0, 100.0),
            bar("X", "2024-01-02", 101.0, 101.0),
            bar("X", "2024-01-03", 105.0, 100.0),
        ]);

        let found = scan(&repo, "2023-12-31");
        assert_eq!(
            found,
            vec![UndeclaredEvent {
                symbol: "X".into(),
                date: date("2024-01-03"),
                implied_amount: 5.0,
            }]
        );
    }

    #[test]
    fn test_only_latest_divergence_per_instrument() {
        let repo = seeded(&[
            bar("A", "2024-01-01", 10.0, 9.5),
            bar("A", "2024-01-02", 10.0, 9.75),
            bar("A", "2024-01-03", 10.0, 10.0),
            bar("B", "2024-01-01", 30.0, 30.0),
            bar("C", "2024-01-02", 7.0, 6.876_54),
        ]);

        let found = scan(&repo, "2023-12-31");
        assert_eq!(found.len(), 2);
        assert_eq!((found[0].symbol.as_str(), found[0].date), ("A", date("2024-01-02")));
        assert_eq!(found[0].implied_amount, 0.25);
        assert_eq!(found[1].symbol, "C");
        assert_eq!(found[1].implied_amount, 0.123);
    }

    #[test]
    fn test_respects_since_and_float_noise() {
        let repo = seeded(&[
            bar("A", "2024-01-01", 10.0, 9.0),
            bar("A", "2024-01-05", 10.0, 10.0 - 1e-9),
        ]);

        assert!(scan(&repo, "2024-01-01").is_empty());
        assert_eq!(scan(&repo, "2023-12-31").len(), 1);
    }

    #[test]
    fn test_applied_event_explains_earlier_gaps() {
        let repo = seeded(&[
            bar("X", "2024-01-01", 50.0, 50.0),
            bar("X", "2024-01-02", 50.0, 50.0),
            bar("X", "2024-01-03", 52.0, 52.0),
        ]);
        let engine = AdjustmentEngine::new(&repo, AdjustmentConfig::default());
        engine
            .apply_dividend_adjustment("X", date("2024-01-03"), 2.0)
            .unwrap();

        assert!(scan(&repo, "2023-12-31").is_empty());
    }

    #[test]
    fn test_restart_replays_and_is_read_only() {
        let repo = seeded(&[
            bar("A", "2024-01-02", 10.0, 9.0),
            bar("B", "2024-01-02", 20.0, 19.0),
        ]);
        let before = (repo.price_series("A").unwrap(), repo.price_series("B").unwrap());

        let engine = AdjustmentEngine::new(&repo, AdjustmentConfig::default());
        let mut it = engine.find_undeclared_events(date("2024-01-01"));
        let first = it.next().unwrap().unwrap();
        assert_eq!(first.symbol, "A");

        it.restart();
        let all: Vec<_> = it.map(|r| r.unwrap().symbol).collect();
        assert_eq!(all, vec!["A", "B"]);

        assert_eq!(
            (repo.price_series("A").unwrap(), repo.price_series("B").unwrap()),
            before
        );
    }
}
