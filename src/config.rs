use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GoldApiConfig {
    pub base_url: String,
    /// Without a key the upstream tier is effectively disabled and every
    /// read falls through to stale/default values.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for GoldApiConfig {
    fn default() -> Self {
        GoldApiConfig {
            base_url: "https://www.goldapi.io".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexConfig {
    pub base_url: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            base_url: "https://query1.finance.yahoo.com".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SpotCacheConfig {
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    #[serde(default = "default_jitter_frac")]
    pub jitter_frac: f64,
    #[serde(default = "default_expected_currency")]
    pub expected_currency: String,
    /// Fixed approximate rate for correcting upstream currency mismatches.
    #[serde(default = "default_usd_per_eur")]
    pub usd_per_eur: f64,
    /// Served when no tier has ever produced a price. Equal to the fallback
    /// reference unit price so a default-sourced spot is valuation-neutral.
    #[serde(default = "default_spot_price")]
    pub default_price: f64,
}

fn default_base_interval_secs() -> u64 {
    45
}

fn default_jitter_frac() -> f64 {
    0.2
}

fn default_expected_currency() -> String {
    "EUR".to_string()
}

fn default_usd_per_eur() -> f64 {
    1.08
}

fn default_spot_price() -> f64 {
    28.50
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    5
}

impl Default for SpotCacheConfig {
    fn default() -> Self {
        SpotCacheConfig {
            base_interval_secs: default_base_interval_secs(),
            jitter_frac: default_jitter_frac(),
            expected_currency: default_expected_currency(),
            usd_per_eur: default_usd_per_eur(),
            default_price: default_spot_price(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub data_path: Option<PathBuf>,
    #[serde(default)]
    pub goldapi: GoldApiConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub cache: SpotCacheConfig,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            listen_addr: default_listen_addr(),
            data_path: None,
            goldapi: GoldApiConfig::default(),
            index: IndexConfig::default(),
            cache: SpotCacheConfig::default(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        let mut config = if config_path.exists() {
            Self::read_file(&config_path)?
        } else {
            AppConfig::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::read_file(path.as_ref())?;
        config.apply_env();
        Ok(config)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "argentum", "argentum")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    /// Where the durable store lives; `None` in the config falls back to the
    /// platform data directory.
    pub fn store_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.data_path {
            return Some(path.clone());
        }
        ProjectDirs::from("com", "argentum", "argentum").map(|dirs| dirs.data_dir().join("store"))
    }

    fn read_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ARGENTUM_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("ARGENTUM_DATA_PATH") {
            self.data_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("GOLDAPI_BASE_URL") {
            self.goldapi.base_url = v;
        }
        if let Ok(v) = std::env::var("GOLDAPI_KEY") {
            self.goldapi.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("ARGENTUM_INDEX_BASE_URL") {
            self.index.base_url = v;
        }
        if let Some(secs) = env_override("ARGENTUM_SPOT_INTERVAL_SECS") {
            self.cache.base_interval_secs = secs;
        }
        if let Some(frac) = env_override("ARGENTUM_SPOT_JITTER_FRAC") {
            self.cache.jitter_frac = frac;
        }
        if let Some(rate) = env_override("ARGENTUM_USD_PER_EUR") {
            self.cache.usd_per_eur = rate;
        }
        if let Some(price) = env_override("ARGENTUM_DEFAULT_SPOT_PRICE") {
            self.cache.default_price = price;
        }
        if let Some(secs) = env_override("ARGENTUM_UPSTREAM_TIMEOUT_SECS") {
            self.upstream_timeout_secs = secs;
        }
    }
}

/// Numeric env override. A value that does not parse is reported and
/// ignored, keeping whatever the config file or defaults provided.
fn env_override<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(%name, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}
