use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub fmp: FmpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub adjustment: AdjustmentConfig,
}

/// FMP REST client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FmpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Usually supplied as `FMP__FMP__API_KEY` or through `.env`.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Overwrite OHLCV on stored bars instead of skipping them.
    #[serde(default)]
    pub refresh_bars: bool,

    /// `quarter` or `annual`
    #[serde(default = "default_metrics_period")]
    pub metrics_period: String,
}

/// Adjustment engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdjustmentConfig {
    /// Decimal places kept on implied dividend amounts.
    #[serde(default = "default_amount_precision")]
    pub amount_precision: u32,

    /// Window scanned by `undeclared`/`reconcile` when `--since` is omitted.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://financialmodelingprep.com/api/v3".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_request_delay_ms() -> u64 {
    250
}
fn default_max_retries() -> u32 {
    3
}
fn default_user_agent() -> String {
    "fmp-etl/0.1 (end-of-day research store)".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/fmp.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    4
}
fn default_metrics_period() -> String {
    "quarter".to_string()
}
fn default_amount_precision() -> u32 {
    3
}
fn default_lookback_days() -> i64 {
    365
}

impl Default for FmpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            refresh_bars: false,
            metrics_period: default_metrics_period(),
        }
    }
}

impl Default for AdjustmentConfig {
    fn default() -> Self {
        Self {
            amount_precision: default_amount_precision(),
            lookback_days: default_lookback_days(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("FMP").separator("__"))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_sources_fall_back_to_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[storage]\ndb_path = \"/tmp/x.duckdb\"\n[adjustment]\namount_precision = 2\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.storage.db_path, PathBuf::from("/tmp/x.duckdb"));
        assert!(cfg.storage.run_migrations);
        assert_eq!(cfg.adjustment.amount_precision, 2);
        assert_eq!(cfg.adjustment.lookback_days, 365);
        assert_eq!(cfg.pipeline.concurrency, 4);
        assert!(!cfg.pipeline.refresh_bars);
        assert_eq!(cfg.pipeline.metrics_period, "quarter");
        assert!(cfg.fmp.base_url.starts_with("https://financialmodelingprep.com"));
    }
}
