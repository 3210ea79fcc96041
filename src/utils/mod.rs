use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Logs how long a CLI phase took when dropped.
pub struct Timer {
    phase: &'static str,
    started: Instant,
}

impl Timer {
    pub fn start(phase: &'static str) -> Self {
        debug!("{}: started", phase);
        Self { phase, started: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!("{}: finished in {:.2?}", self.phase, self.elapsed());
    }
}

/// `1234567` → `1,234,567`.
pub fn fmt_number(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let groups: Vec<&str> = digits
        .as_bytes()
        .rchunks(3)
        .rev()
        .filter_map(|g| std::str::from_utf8(g).ok())
        .collect();
    let sign = if n < 0 { "-" } else { "" };
    format!("{}{}", sign, groups.join(","))
}

pub fn normalise_symbol(s: &str) -> String {
    s.trim().to_uppercase()
}

/// Round half away from zero to `places` decimals.
/// Strips float noise like 4.999999999 before amounts are compared or hashed.
pub fn round_to(value: f64, places: u32) -> f64 {
    let scale = 10f64.powi(places as i32);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_number() {
        assert_eq!(fmt_number(1_234_567), "1,234,567");
        assert_eq!(fmt_number(0), "0");
        assert_eq!(fmt_number(-42_000), "-42,000");
        assert_eq!(fmt_number(999), "999");
    }

    #[test]
    fn test_normalise_symbol() {
        assert_eq!(normalise_symbol(" aapl "), "AAPL");
        assert_eq!(normalise_symbol("BRK.B"), "BRK.B");
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(4.999_999_9, 3), 5.0);
        assert_eq!(round_to(1.923_076, 3), 1.923);
        assert_eq!(round_to(-0.000_4, 3), 0.0);
        assert_eq!(round_to(2.5, 0), 3.0);
    }
}
