//! Derived share price calculation.
//!
//! The total share count is pinned by the manually curated reference state
//! (reference unit price + base share price), so a tick in the live spot
//! price moves the share price without changing the implied share count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Singleton fund composition, as stored in the parameter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundParameters {
    /// EUR value of the non-commodity portion of the fund.
    pub base_fund_value: f64,
    /// Silver holdings in troy ounces.
    pub commodity_units: f64,
    /// Manually set reference price per troy ounce, in EUR.
    pub reference_unit_price: f64,
    /// Share price corresponding to the reference state.
    pub base_share_price: f64,
    pub last_updated: DateTime<Utc>,
}

impl FundParameters {
    /// Built-in parameters used whenever the store is unavailable or empty.
    pub fn fallback() -> Self {
        FundParameters {
            base_fund_value: 575_000.0,
            commodity_units: 5_000.0,
            reference_unit_price: 28.50,
            base_share_price: 1.824,
            last_updated: Utc::now(),
        }
    }
}

/// Computes the current share price from fund parameters and a live spot
/// price. Pure; never returns NaN or infinity.
///
/// Degenerate parameters (non-positive base share price or reference value)
/// yield `base_share_price` itself rather than an error.
pub fn compute_share_price(params: &FundParameters, live_spot_price: f64) -> f64 {
    if params.base_share_price <= 0.0 {
        return params.base_share_price;
    }

    let reference_commodity_value = params.commodity_units * params.reference_unit_price;
    let reference_fund_value = params.base_fund_value + reference_commodity_value;
    let total_shares = reference_fund_value / params.base_share_price;

    if !total_shares.is_finite() || total_shares <= 0.0 {
        return params.base_share_price;
    }

    let live_commodity_value = params.commodity_units * live_spot_price;
    (params.base_fund_value + live_commodity_value) / total_shares
}
