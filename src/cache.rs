//! Tiered spot price cache.
//!
//! Resolves "what is the current spot price" with as few upstream calls as
//! possible: memory tier (instance-local, lost on restart), then the durable
//! parameter store (shared across instances), then the upstream provider.
//! The surface is infallible; total failure of every tier degrades to a
//! configured default price.

use crate::config::SpotCacheConfig;
use crate::providers::{SpotPriceProvider, SpotQuote};
use crate::store::ParamStore;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Provenance tag for a resolved spot price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceSource {
    Memory,
    Durable,
    Upstream,
    StaleUpstreamFailure,
    Default,
}

impl Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            PriceSource::Memory => "memory",
            PriceSource::Durable => "durable",
            PriceSource::Upstream => "upstream",
            PriceSource::StaleUpstreamFailure => "stale-upstream-failure",
            PriceSource::Default => "default",
        };
        write!(f, "{tag}")
    }
}

/// Cached price in one tier. `fetched_at` is only advanced on a successful
/// upstream fetch, so a failed refresh retries on the next read instead of
/// waiting out the interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotEntry {
    pub price: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Spot price resolved through the tiers, with provenance.
#[derive(Debug, Clone, Copy)]
pub struct SpotPrice {
    pub price: f64,
    pub source: PriceSource,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub base_interval: Duration,
    /// Fraction of the base interval used as uniform jitter, so sibling
    /// instances do not all expire and refetch at the same moment.
    pub jitter_frac: f64,
    pub expected_currency: String,
    pub usd_per_eur: f64,
    pub default_price: f64,
}

impl From<&SpotCacheConfig> for CacheSettings {
    fn from(config: &SpotCacheConfig) -> Self {
        CacheSettings {
            base_interval: Duration::seconds(config.base_interval_secs as i64),
            jitter_frac: config.jitter_frac,
            expected_currency: config.expected_currency.clone(),
            usd_per_eur: config.usd_per_eur,
            default_price: config.default_price,
        }
    }
}

pub struct TieredPriceCache {
    upstream: Arc<dyn SpotPriceProvider>,
    store: Option<Arc<dyn ParamStore>>,
    memory: Mutex<Option<SpotEntry>>,
    settings: CacheSettings,
}

impl TieredPriceCache {
    pub fn new(
        upstream: Arc<dyn SpotPriceProvider>,
        store: Option<Arc<dyn ParamStore>>,
        settings: CacheSettings,
    ) -> Self {
        TieredPriceCache {
            upstream,
            store,
            memory: Mutex::new(None),
            settings,
        }
    }

    /// Resolves the current spot price at `now`, walking the tiers.
    pub async fn spot_price(&self, now: DateTime<Utc>) -> SpotPrice {
        let interval = self.effective_interval();

        {
            let memory = self.memory.lock().await;
            if let Some(entry) = memory.as_ref() {
                if is_fresh(entry, now, interval) {
                    debug!(price = entry.price, "spot price served from memory tier");
                    return SpotPrice {
                        price: entry.price,
                        source: PriceSource::Memory,
                        fetched_at: entry.fetched_at,
                    };
                }
            }
        }

        let durable = self.read_durable().await;
        if let Some(entry) = durable.as_ref() {
            if is_fresh(entry, now, interval) {
                debug!(price = entry.price, "spot price served from durable tier");
                let mut memory = self.memory.lock().await;
                *memory = Some(entry.clone());
                return SpotPrice {
                    price: entry.price,
                    source: PriceSource::Durable,
                    fetched_at: entry.fetched_at,
                };
            }
        }

        match self.upstream.fetch_spot().await {
            Ok(quote) => {
                let price = self.normalize(&quote);
                let entry = SpotEntry {
                    price,
                    fetched_at: now,
                };
                self.write_durable(&entry).await;
                let mut memory = self.memory.lock().await;
                *memory = Some(entry);
                debug!(price, "spot price refreshed from upstream");
                SpotPrice {
                    price,
                    source: PriceSource::Upstream,
                    fetched_at: now,
                }
            }
            Err(err) => {
                warn!(error = %err, "upstream spot fetch failed");

                // Serve the last known stale price without advancing its
                // timestamp, so the next read retries upstream immediately.
                if let Some(entry) = durable {
                    return SpotPrice {
                        price: entry.price,
                        source: PriceSource::StaleUpstreamFailure,
                        fetched_at: entry.fetched_at,
                    };
                }
                let memory = self.memory.lock().await;
                if let Some(entry) = memory.as_ref() {
                    return SpotPrice {
                        price: entry.price,
                        source: PriceSource::StaleUpstreamFailure,
                        fetched_at: entry.fetched_at,
                    };
                }

                SpotPrice {
                    price: self.settings.default_price,
                    source: PriceSource::Default,
                    fetched_at: now,
                }
            }
        }
    }

    /// Clears the memory tier only. The durable tier is untouched.
    pub async fn invalidate(&self) {
        let mut memory = self.memory.lock().await;
        *memory = None;
        debug!("memory tier invalidated");
    }

    fn effective_interval(&self) -> Duration {
        let jitter = self.settings.jitter_frac;
        if !(jitter > 0.0) {
            return self.settings.base_interval;
        }
        // Cap the band below 1.0 so the interval never collapses to zero.
        let jitter = jitter.min(0.9);
        let base_ms = self.settings.base_interval.num_milliseconds() as f64;
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        Duration::milliseconds((base_ms * factor) as i64)
    }

    /// The upstream nominally answers in the requested currency but has been
    /// observed returning USD when EUR was requested. Convert with the fixed
    /// configured rate when the reported currency does not match.
    fn normalize(&self, quote: &SpotQuote) -> f64 {
        if quote
            .currency
            .eq_ignore_ascii_case(&self.settings.expected_currency)
        {
            quote.price
        } else {
            warn!(
                reported = %quote.currency,
                expected = %self.settings.expected_currency,
                "upstream currency mismatch, converting with fixed rate"
            );
            quote.price / self.settings.usd_per_eur
        }
    }

    async fn read_durable(&self) -> Option<SpotEntry> {
        let store = self.store.as_ref()?;
        match store.read_spot().await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "durable tier read failed");
                None
            }
        }
    }

    async fn write_durable(&self, entry: &SpotEntry) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        // Best effort; a failed durable write must not fail the read.
        if let Err(err) = store.write_spot(entry).await {
            warn!(error = %err, "durable tier write failed");
        }
    }
}

fn is_fresh(entry: &SpotEntry, now: DateTime<Utc>, interval: Duration) -> bool {
    now.signed_duration_since(entry.fetched_at) < interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        quote: Option<SpotQuote>,
        call_count: AtomicUsize,
    }

    impl StubProvider {
        fn ok(price: f64, currency: &str) -> Self {
            StubProvider {
                quote: Some(SpotQuote {
                    price,
                    currency: currency.to_string(),
                }),
                call_count: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            StubProvider {
                quote: None,
                call_count: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpotPriceProvider for Arc<StubProvider> {
        async fn fetch_spot(&self) -> anyhow::Result<SpotQuote> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            match &self.quote {
                Some(quote) => Ok(quote.clone()),
                None => Err(anyhow!("upstream down")),
            }
        }
    }

    fn settings() -> CacheSettings {
        CacheSettings {
            base_interval: Duration::seconds(45),
            jitter_frac: 0.0,
            expected_currency: "EUR".to_string(),
            usd_per_eur: 1.08,
            default_price: 28.50,
        }
    }

    fn cache_with(
        provider: Arc<StubProvider>,
        store: Option<Arc<dyn ParamStore>>,
    ) -> TieredPriceCache {
        TieredPriceCache::new(Arc::new(provider), store, settings())
    }

    #[tokio::test]
    async fn test_upstream_then_memory() {
        let provider = Arc::new(StubProvider::ok(29.0, "EUR"));
        let cache = cache_with(Arc::clone(&provider), None);
        let t0 = Utc::now();

        let first = cache.spot_price(t0).await;
        assert_eq!(first.source, PriceSource::Upstream);
        assert_eq!(first.price, 29.0);
        assert_eq!(provider.calls(), 1);

        let second = cache.spot_price(t0 + Duration::seconds(10)).await;
        assert_eq!(second.source, PriceSource::Memory);
        assert_eq!(second.price, 29.0);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_freshness_boundary() {
        let provider = Arc::new(StubProvider::ok(29.0, "EUR"));
        let cache = cache_with(Arc::clone(&provider), None);
        let t0 = Utc::now();

        cache.spot_price(t0).await;

        // Just inside the interval: memory tier.
        let inside = cache
            .spot_price(t0 + Duration::seconds(45) - Duration::milliseconds(1))
            .await;
        assert_eq!(inside.source, PriceSource::Memory);

        // Just past the interval: promoted to upstream again.
        let outside = cache
            .spot_price(t0 + Duration::seconds(45) + Duration::milliseconds(1))
            .await;
        assert_eq!(outside.source, PriceSource::Upstream);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_durable_tier_populates_memory() {
        let provider = Arc::new(StubProvider::ok(29.0, "EUR"));
        let store: Arc<dyn ParamStore> = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        store
            .write_spot(&SpotEntry {
                price: 30.5,
                fetched_at: t0,
            })
            .await
            .unwrap();

        let cache = cache_with(Arc::clone(&provider), Some(store));

        // Cold start with a sibling's fresh durable entry: no upstream call.
        let first = cache.spot_price(t0 + Duration::seconds(10)).await;
        assert_eq!(first.source, PriceSource::Durable);
        assert_eq!(first.price, 30.5);
        assert_eq!(provider.calls(), 0);

        let second = cache.spot_price(t0 + Duration::seconds(20)).await;
        assert_eq!(second.source, PriceSource::Memory);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_serves_stale_without_advancing() {
        let provider = Arc::new(StubProvider::failing());
        let store: Arc<dyn ParamStore> = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        store
            .write_spot(&SpotEntry {
                price: 30.5,
                fetched_at: t0,
            })
            .await
            .unwrap();

        let cache = cache_with(Arc::clone(&provider), Some(store));
        let later = t0 + Duration::seconds(120);

        let first = cache.spot_price(later).await;
        assert_eq!(first.source, PriceSource::StaleUpstreamFailure);
        assert_eq!(first.price, 30.5);
        assert_eq!(first.fetched_at, t0);

        // The failure did not advance the timestamp; the very next read
        // retries upstream instead of treating the entry as fresh.
        let second = cache.spot_price(later + Duration::seconds(1)).await;
        assert_eq!(second.source, PriceSource::StaleUpstreamFailure);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_currency_mismatch_converted() {
        let provider = Arc::new(StubProvider::ok(31.25, "USD"));
        let cache = cache_with(Arc::clone(&provider), None);

        let spot = cache.spot_price(Utc::now()).await;
        assert_eq!(spot.source, PriceSource::Upstream);
        assert!((spot.price - 31.25 / 1.08).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_matching_currency_not_converted() {
        let provider = Arc::new(StubProvider::ok(28.9, "EUR"));
        let cache = cache_with(Arc::clone(&provider), None);

        let spot = cache.spot_price(Utc::now()).await;
        assert_eq!(spot.price, 28.9);
    }

    #[tokio::test]
    async fn test_default_when_nothing_available() {
        let provider = Arc::new(StubProvider::failing());
        let cache = cache_with(Arc::clone(&provider), None);
        let now = Utc::now();

        let spot = cache.spot_price(now).await;
        assert_eq!(spot.source, PriceSource::Default);
        assert_eq!(spot.price, 28.50);
        assert_eq!(spot.fetched_at, now);
    }

    #[tokio::test]
    async fn test_upstream_success_writes_durable_tier() {
        let provider = Arc::new(StubProvider::ok(29.0, "EUR"));
        let store: Arc<dyn ParamStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Arc::clone(&provider), Some(Arc::clone(&store)));
        let t0 = Utc::now();

        cache.spot_price(t0).await;

        let entry = store.read_spot().await.unwrap().unwrap();
        assert_eq!(entry.price, 29.0);
        assert_eq!(entry.fetched_at, t0);
    }

    #[tokio::test]
    async fn test_invalidate_clears_memory_only() {
        let provider = Arc::new(StubProvider::ok(29.0, "EUR"));
        let store: Arc<dyn ParamStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Arc::clone(&provider), Some(Arc::clone(&store)));
        let t0 = Utc::now();

        cache.spot_price(t0).await;
        cache.invalidate().await;

        // Memory gone, durable entry still fresh: served from durable.
        let spot = cache.spot_price(t0 + Duration::seconds(5)).await;
        assert_eq!(spot.source, PriceSource::Durable);
        assert!(store.read_spot().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_memory_served_when_upstream_fails_without_store() {
        let provider = Arc::new(StubProvider::failing());
        let cache = cache_with(Arc::clone(&provider), None);
        let t0 = Utc::now();
        {
            let mut memory = cache.memory.lock().await;
            *memory = Some(SpotEntry {
                price: 27.0,
                fetched_at: t0,
            });
        }

        let spot = cache.spot_price(t0 + Duration::seconds(120)).await;
        assert_eq!(spot.source, PriceSource::StaleUpstreamFailure);
        assert_eq!(spot.price, 27.0);
        assert_eq!(spot.fetched_at, t0);
    }

    #[test]
    fn test_jittered_interval_stays_in_band() {
        let provider = Arc::new(StubProvider::ok(29.0, "EUR"));
        let mut s = settings();
        s.jitter_frac = 0.2;
        let cache = TieredPriceCache::new(Arc::new(provider), None, s);

        for _ in 0..100 {
            let interval = cache.effective_interval();
            let ms = interval.num_milliseconds();
            assert!((36_000..=54_000).contains(&ms), "interval out of band: {ms}");
        }
    }

    #[test]
    fn test_oversized_jitter_keeps_interval_positive() {
        let provider = Arc::new(StubProvider::ok(29.0, "EUR"));
        let mut s = settings();
        s.jitter_frac = 1.5;
        let cache = TieredPriceCache::new(Arc::new(provider), None, s);

        for _ in 0..100 {
            let ms = cache.effective_interval().num_milliseconds();
            assert!(ms > 0, "interval collapsed: {ms}");
            assert!((4_500..=85_500).contains(&ms), "interval out of band: {ms}");
        }
    }

    #[test]
    fn test_price_source_tags() {
        assert_eq!(PriceSource::Memory.to_string(), "memory");
        assert_eq!(
            PriceSource::StaleUpstreamFailure.to_string(),
            "stale-upstream-failure"
        );
        assert_eq!(
            serde_json::to_value(PriceSource::StaleUpstreamFailure).unwrap(),
            serde_json::json!("stale-upstream-failure")
        );
        assert_eq!(
            serde_json::to_value(PriceSource::Default).unwrap(),
            serde_json::json!("default")
        );
    }
}
