pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod log;
pub mod providers;
pub mod store;
pub mod valuation;

pub use api::app_router;

use crate::cache::{CacheSettings, TieredPriceCache};
use crate::config::AppConfig;
use crate::providers::goldapi::GoldApiProvider;
use crate::providers::yahoo::YahooIndexProvider;
use crate::store::{FjallStore, MemoryStore, ParamStore};
use crate::valuation::FundParameters;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct AppState {
    pub cache: TieredPriceCache,
    pub index: YahooIndexProvider,
    pub currency: String,
    store: Option<Arc<dyn ParamStore>>,
    fallback: Arc<dyn ParamStore>,
}

impl AppState {
    /// The durable store when configured, else the in-process fallback so
    /// admin writes still take effect within this instance.
    pub fn params_store(&self) -> Arc<dyn ParamStore> {
        self.store
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Current fund parameters; any store trouble degrades to the built-in
    /// fallback parameters.
    pub async fn fund_parameters(&self) -> FundParameters {
        match self.params_store().read_params().await {
            Ok(Some(params)) => params,
            Ok(None) => FundParameters::fallback(),
            Err(err) => {
                warn!(error = %err, "parameter store read failed, using fallback parameters");
                FundParameters::fallback()
            }
        }
    }
}

pub fn build_state(config: &AppConfig) -> Result<Arc<AppState>> {
    let store: Option<Arc<dyn ParamStore>> = match config.store_path() {
        Some(path) => match FjallStore::open(&path) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(error = %err, "could not open parameter store, running without durable tier");
                None
            }
        },
        None => None,
    };

    let timeout = Duration::from_secs(config.upstream_timeout_secs);
    let upstream = GoldApiProvider::new(
        &config.goldapi.base_url,
        config.goldapi.api_key.clone(),
        &config.cache.expected_currency,
        timeout,
    )?;
    let cache = TieredPriceCache::new(
        Arc::new(upstream),
        store.clone(),
        CacheSettings::from(&config.cache),
    );
    let index = YahooIndexProvider::new(
        &config.index.base_url,
        chrono::Duration::seconds(config.cache.base_interval_secs as i64),
        timeout,
    )?;

    Ok(Arc::new(AppState {
        cache,
        index,
        currency: config.cache.expected_currency.clone(),
        store,
        fallback: Arc::new(MemoryStore::new()),
    }))
}

pub async fn serve(config: AppConfig) -> Result<()> {
    let state = build_state(&config)?;
    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Listening on {}", config.listen_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
