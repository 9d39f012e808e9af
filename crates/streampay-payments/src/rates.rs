//! Exchange-rate lookup against the configured rates service, with a
//! short-lived cache so quoting does not hammer the provider.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RateError {
    #[error("failed to fetch rates: {0}")]
    FetchFailed(String),
    #[error("no rate known for {0} -> {1}")]
    UnknownRate(String, String),
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Units of `destination_code` one unit of `source_code` buys.
    async fn rate(&self, source_code: &str, destination_code: &str) -> Result<f64, RateError>;
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    base: String,
    rates: HashMap<String, f64>,
}

struct CachedRates {
    rates: HashMap<String, f64>,
    fetched_at: Instant,
}

/// Fetches `{exchange_rates_url}?base=<code>` and caches the result for the
/// configured lifetime.
pub struct RateService {
    client: reqwest::Client,
    url: String,
    lifetime: Duration,
    cache: Mutex<HashMap<String, CachedRates>>,
}

impl RateService {
    pub fn new(url: impl Into<String>, lifetime: Duration) -> Self {
        RateService {
            client: reqwest::Client::new(),
            url: url.into(),
            lifetime,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch(&self, base: &str) -> Result<HashMap<String, f64>, RateError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("base", base)])
            .send()
            .await
            .map_err(|err| RateError::FetchFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(RateError::FetchFailed(format!(
                "rates service returned {}",
                response.status()
            )));
        }
        let body: RatesResponse = response
            .json()
            .await
            .map_err(|err| RateError::FetchFailed(err.to_string()))?;
        if body.base != base {
            warn!(
                "Rates service answered for base {} instead of {}",
                body.base, base
            );
        }
        Ok(body.rates)
    }
}

#[async_trait]
impl RateProvider for RateService {
    async fn rate(&self, source_code: &str, destination_code: &str) -> Result<f64, RateError> {
        if source_code == destination_code {
            return Ok(1.0);
        }
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(source_code) {
                if cached.fetched_at.elapsed() < self.lifetime {
                    return cached.rates.get(destination_code).copied().ok_or_else(|| {
                        RateError::UnknownRate(
                            source_code.to_string(),
                            destination_code.to_string(),
                        )
                    });
                }
            }
        }

        let rates = self.fetch(source_code).await?;
        debug!("Fetched {} rates for base {}", rates.len(), source_code);
        let rate = rates.get(destination_code).copied();
        self.cache.lock().insert(
            source_code.to_string(),
            CachedRates {
                rates,
                fetched_at: Instant::now(),
            },
        );
        rate.ok_or_else(|| {
            RateError::UnknownRate(source_code.to_string(), destination_code.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_asset_is_always_one() {
        let service = RateService::new("http://localhost:0", Duration::from_secs(15));
        assert_eq!(service.rate("USD", "USD").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn fetches_and_caches() {
        let mock = mockito::mock("GET", "/")
            .match_query(mockito::Matcher::UrlEncoded("base".into(), "USD".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"base": "USD", "rates": {"XRP": 0.5}}"#)
            .expect(1)
            .create();

        let service = RateService::new(mockito::server_url(), Duration::from_secs(60));
        assert_eq!(service.rate("USD", "XRP").await.unwrap(), 0.5);
        // second hit comes from the cache
        assert_eq!(service.rate("USD", "XRP").await.unwrap(), 0.5);
        assert!(matches!(
            service.rate("USD", "EUR").await,
            Err(RateError::UnknownRate(_, _))
        ));
        mock.assert();
    }

    #[tokio::test]
    async fn surfaces_fetch_failures() {
        let _mock = mockito::mock("GET", "/")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create();
        let service = RateService::new(mockito::server_url(), Duration::from_secs(60));
        assert!(matches!(
            service.rate("USD", "XRP").await,
            Err(RateError::FetchFailed(_))
        ));
    }
}
