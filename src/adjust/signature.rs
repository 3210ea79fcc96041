use crate::utils::normalise_symbol;
use chrono::NaiveDate;

/// Deterministic token for a dividend event.
///
/// BLAKE3 over `SYMBOL|YYYY-MM-DD|amount` with the amount fixed at six
/// decimals, so replays of the same event hash identically.
pub fn signature_of(symbol: &str, date: NaiveDate, amount: f64) -> String {
    let canonical = format!(
        "{}|{}|{:.6}",
        normalise_symbol(symbol),
        date.format("%Y-%m-%d"),
        amount
    );
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_signature_is_stable() {
        let a = signature_of("AAPL", d("2024-02-09"), 0.24);
        let b = signature_of("AAPL", d("2024-02-09"), 0.24);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_signature_changes_with_each_field() {
        let base = signature_of("AAPL", d("2024-02-09"), 0.24);
        assert_ne!(base, signature_of("MSFT", d("2024-02-09"), 0.24));
        assert_ne!(base, signature_of("AAPL", d("2024-02-12"), 0.24));
        assert_ne!(base, signature_of("AAPL", d("2024-02-09"), 0.25));
    }

    #[test]
    fn test_signature_ignores_case_and_float_noise() {
        assert_eq!(
            signature_of(" aapl", d("2024-02-09"), 0.1 + 0.2),
            signature_of("AAPL", d("2024-02-09"), 0.3)
        );
    }
}
