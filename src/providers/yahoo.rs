use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// S&P 500 index baseline from 2013-08-08, used to normalize the index to a
/// chart-friendly scale.
pub const SP500_BASELINE: f64 = 1697.48;

/// Last known good index value, served when the upstream is unreachable.
pub const SP500_FALLBACK_PRICE: f64 = 6713.71;

const SP500_SYMBOL: &str = "%5EGSPC";

#[derive(Debug, Clone, Copy)]
pub struct IndexSnapshot {
    pub actual_price: f64,
    pub normalized_price: f64,
}

/// Yahoo Finance chart provider for the S&P 500 index, with an instance-local
/// freshness-bounded cache.
pub struct YahooIndexProvider {
    base_url: String,
    client: reqwest::Client,
    interval: Duration,
    cache: Mutex<Option<(IndexSnapshot, DateTime<Utc>)>>,
}

#[derive(Debug, Deserialize)]
struct YahooChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Vec<ChartItem>,
}

#[derive(Debug, Deserialize)]
struct ChartItem {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(alias = "regularMarketPrice")]
    regular_market_price: f64,
}

impl YahooIndexProvider {
    pub fn new(base_url: &str, interval: Duration, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("argentum/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(YahooIndexProvider {
            base_url: base_url.to_string(),
            client,
            interval,
            cache: Mutex::new(None),
        })
    }

    pub async fn fetch_index(&self, now: DateTime<Utc>) -> Result<IndexSnapshot> {
        {
            let cache = self.cache.lock().await;
            if let Some((snapshot, fetched_at)) = cache.as_ref() {
                if now.signed_duration_since(*fetched_at) < self.interval {
                    debug!("Index price served from cache");
                    return Ok(*snapshot);
                }
            }
        }

        let url = format!("{}/v8/finance/chart/{}", self.base_url, SP500_SYMBOL);
        debug!("Requesting index price from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("Request error: {} for URL: {}", e, url))?;

        if !response.status().is_success() {
            return Err(anyhow!("HTTP error: {} from Yahoo", response.status()));
        }

        let data = response
            .json::<YahooChartResponse>()
            .await
            .context("Failed to parse Yahoo chart response")?;
        let item = data
            .chart
            .result
            .first()
            .ok_or_else(|| anyhow!("No index data in Yahoo response"))?;

        let actual_price = item.meta.regular_market_price;
        let snapshot = IndexSnapshot {
            actual_price,
            normalized_price: actual_price / SP500_BASELINE,
        };

        let mut cache = self.cache.lock().await;
        *cache = Some((snapshot, now));
        Ok(snapshot)
    }
}
