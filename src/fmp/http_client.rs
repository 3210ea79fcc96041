use crate::config::FmpConfig;
use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: StatusCode },

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl FetchError {
    /// Worth another attempt: network trouble, rate limiting, server errors.
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            FetchError::Url(_) => false,
        }
    }
}

pub struct HttpClient {
    inner: reqwest::Client,
    config: FmpConfig,
}

impl HttpClient {
    pub fn new(config: &FmpConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            config: config.clone(),
        })
    }

    /// `{base_url}/{path}?{query}&apikey=…`
    pub fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, FetchError> {
        let base = self.config.base_url.trim_end_matches('/');
        let url = Url::parse_with_params(
            &format!("{}/{}", base, path.trim_start_matches('/')),
            query
                .iter()
                .copied()
                .chain(std::iter::once(("apikey", self.config.api_key.as_str()))),
        )?;
        Ok(url)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_json_with(path, &[]).await
    }

    /// GET a JSON document with rate-limiting and retry.
    pub async fn get_json_with<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = self.endpoint(path, query)?;
        self.polite_delay().await;

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.config.request_delay_ms.max(1))
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(self.config.max_retries as usize);

        let body = RetryIf::spawn(
            strategy,
            || self.get_once(&url),
            |e: &FetchError| {
                let retry = e.is_transient();
                if retry {
                    warn!("{}, retrying", e);
                }
                retry
            },
        )
        .await
        .with_context(|| format!("All retries exhausted for {}", path))?;

        serde_json::from_str(&body).with_context(|| format!("Malformed JSON from {}", path))
    }

    async fn get_once(&self, url: &Url) -> Result<String, FetchError> {
        // The API key rides in the query string; keep it out of logs.
        let shown = url.path().to_string();
        debug!("GET {}", shown);

        let resp = self
            .inner
            .get(url.clone())
            .send()
            .await
            .map_err(|source| FetchError::Transport { url: shown.clone(), source })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: shown, status });
        }

        resp.text()
            .await
            .map_err(|source| FetchError::Transport { url: shown, source })
    }

    async fn polite_delay(&self) {
        sleep(Duration::from_millis(self.config.request_delay_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_carries_api_key() {
        let client = HttpClient::new(&FmpConfig {
            base_url: "https://example.test/api/v3/".into(),
            api_key: "k3y".into(),
            ..FmpConfig::default()
        })
        .unwrap();

        let url = client.endpoint("/historical-price-full/AAPL", &[]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/api/v3/historical-price-full/AAPL?apikey=k3y"
        );

        let url = client.endpoint("key-metrics/AAPL", &[("period", "quarter")]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/api/v3/key-metrics/AAPL?period=quarter&apikey=k3y"
        );
    }

    #[test]
    fn test_transient_errors() {
        let status = |s: StatusCode| FetchError::Status { url: "/x".into(), status: s };
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(!status(StatusCode::FORBIDDEN).is_transient());
        assert!(!status(StatusCode::NOT_FOUND).is_transient());
    }
}
