//! Upstream price providers.

use anyhow::Result;
use async_trait::async_trait;

pub mod goldapi;
pub mod yahoo;

/// Raw quote as reported by the upstream, before currency normalization.
#[derive(Debug, Clone)]
pub struct SpotQuote {
    pub price: f64,
    pub currency: String,
}

#[async_trait]
pub trait SpotPriceProvider: Send + Sync {
    async fn fetch_spot(&self) -> Result<SpotQuote>;
}
