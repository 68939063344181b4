//! Shared parameter store.
//!
//! Holds the singleton fund parameter row and the durable spot price tier.
//! The rest of the crate treats the store as an optional collaborator: a
//! missing or failing store degrades to built-in fallback parameters and
//! never surfaces as a user-facing error.

use crate::cache::SpotEntry;
use crate::valuation::FundParameters;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::Deserialize;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

const PARAMS_KEY: &str = "params";
const SPOT_KEY: &str = "spot";

/// Partial update against the singleton parameter row. Fields left as `None`
/// retain their previous value; `last_updated` is stamped on every write.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamUpdate {
    pub base_fund_value: Option<f64>,
    pub commodity_units: Option<f64>,
    pub reference_unit_price: Option<f64>,
    pub base_share_price: Option<f64>,
}

impl ParamUpdate {
    fn apply(self, mut current: FundParameters) -> FundParameters {
        if let Some(v) = self.base_fund_value {
            current.base_fund_value = v;
        }
        if let Some(v) = self.commodity_units {
            current.commodity_units = v;
        }
        if let Some(v) = self.reference_unit_price {
            current.reference_unit_price = v;
        }
        if let Some(v) = self.base_share_price {
            current.base_share_price = v;
        }
        current.last_updated = Utc::now();
        current
    }
}

#[async_trait]
pub trait ParamStore: Send + Sync {
    /// Reads the singleton parameter row. `Ok(None)` means the store works
    /// but has never been written.
    async fn read_params(&self) -> Result<Option<FundParameters>>;

    /// Upserts the singleton parameter row and returns the stored state.
    async fn update_params(&self, update: ParamUpdate) -> Result<FundParameters>;

    /// Reads the durable spot price tier.
    async fn read_spot(&self) -> Result<Option<SpotEntry>>;

    /// Overwrites the durable spot price tier. Last write wins.
    async fn write_spot(&self, entry: &SpotEntry) -> Result<()>;
}

/// Durable store backed by a fjall keyspace partition.
pub struct FjallStore {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl FjallStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create store directory: {}", path.display()))?;
        let keyspace = fjall::Config::new(path)
            .open()
            .with_context(|| format!("Failed to open keyspace at {}", path.display()))?;
        let partition = keyspace
            .open_partition("fund", PartitionCreateOptions::default())
            .context("Failed to open fund partition")?;
        Ok(FjallStore {
            keyspace,
            partition,
        })
    }

    fn read_row<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.partition.get(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt store row: {key}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn write_row<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.partition.insert(key, serde_json::to_vec(value)?)?;
        // Writes are rare singleton upserts; sync so siblings see them.
        self.keyspace.persist(fjall::PersistMode::SyncData)?;
        debug!("Store PUT for key: {}", key);
        Ok(())
    }
}

#[async_trait]
impl ParamStore for FjallStore {
    async fn read_params(&self) -> Result<Option<FundParameters>> {
        self.read_row(PARAMS_KEY)
    }

    async fn update_params(&self, update: ParamUpdate) -> Result<FundParameters> {
        let current = self
            .read_row::<FundParameters>(PARAMS_KEY)?
            .unwrap_or_else(FundParameters::fallback);
        let next = update.apply(current);
        self.write_row(PARAMS_KEY, &next)?;
        Ok(next)
    }

    async fn read_spot(&self) -> Result<Option<SpotEntry>> {
        self.read_row(SPOT_KEY)
    }

    async fn write_spot(&self, entry: &SpotEntry) -> Result<()> {
        self.write_row(SPOT_KEY, entry)
    }
}

/// In-process store used in tests and as the write target when no durable
/// store is configured.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryRows>,
}

#[derive(Default)]
struct MemoryRows {
    params: Option<FundParameters>,
    spot: Option<SpotEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParamStore for MemoryStore {
    async fn read_params(&self) -> Result<Option<FundParameters>> {
        Ok(self.inner.lock().await.params.clone())
    }

    async fn update_params(&self, update: ParamUpdate) -> Result<FundParameters> {
        let mut rows = self.inner.lock().await;
        let current = rows.params.clone().unwrap_or_else(FundParameters::fallback);
        let next = update.apply(current);
        rows.params = Some(next.clone());
        Ok(next)
    }

    async fn read_spot(&self) -> Result<Option<SpotEntry>> {
        Ok(self.inner.lock().await.spot.clone())
    }

    async fn write_spot(&self, entry: &SpotEntry) -> Result<()> {
        self.inner.lock().await.spot = Some(entry.clone());
        Ok(())
    }
}
