use crate::providers::{SpotPriceProvider, SpotQuote};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Silver spot price provider against a GoldAPI-style endpoint.
///
/// The API key is optional: without one, every fetch fails and the caller
/// falls through its stale/default chain instead.
pub struct GoldApiProvider {
    base_url: String,
    api_key: Option<String>,
    currency: String,
    client: reqwest::Client,
}

impl GoldApiProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        currency: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("argentum/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(GoldApiProvider {
            base_url: base_url.to_string(),
            api_key,
            currency: currency.to_string(),
            client,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GoldApiResponse {
    price: f64,
    currency: String,
}

#[async_trait]
impl SpotPriceProvider for GoldApiProvider {
    #[instrument(name = "GoldApiSpotFetch", skip(self))]
    async fn fetch_spot(&self) -> Result<SpotQuote> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("GoldAPI key not configured"))?;

        // Requested currency is part of the path, but the response body may
        // still report a different one. The caller checks the currency field.
        let url = format!("{}/api/XAG/{}", self.base_url, self.currency);
        debug!("Requesting silver spot price from {}", url);

        let response = self
            .client
            .get(&url)
            .header("x-access-token", api_key)
            .send()
            .await
            .map_err(|e| anyhow!("Request error: {} for URL: {}", e, url))?;

        if !response.status().is_success() {
            return Err(anyhow!("HTTP error: {} from GoldAPI", response.status()));
        }

        let quote = response
            .json::<GoldApiResponse>()
            .await
            .context("Failed to parse GoldAPI response")?;

        if !quote.price.is_finite() || quote.price <= 0.0 {
            return Err(anyhow!(
                "GoldAPI returned non-positive price: {}",
                quote.price
            ));
        }

        Ok(SpotQuote {
            price: quote.price,
            currency: quote.currency,
        })
    }
}
