//! HTTP routes for the price and fund parameter endpoints.
//!
//! Price endpoints always answer 200 with a numeric, renderable price; tier
//! failures show up only in the `source` provenance tag. Admin mutations are
//! gated on the presence of an `admin-token` cookie.

use crate::AppState;
use crate::cache::PriceSource;
use crate::error::{ApiError, ApiResult};
use crate::providers::yahoo::{SP500_BASELINE, SP500_FALLBACK_PRICE};
use crate::store::ParamUpdate;
use crate::valuation::{FundParameters, compute_share_price};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, header},
    routing::get,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

const ADMIN_COOKIE: &str = "admin-token";

pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/healthz", get(healthz))
        .route("/api/silver-price", get(silver_price))
        .route("/api/share-price", get(share_price))
        .route("/api/index-price", get(index_price))
        .route(
            "/api/fund-params",
            get(get_fund_params).post(update_fund_params),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SilverPriceResponse {
    success: bool,
    silver_price: f64,
    currency: String,
    unit: &'static str,
    timestamp: i64,
    source: PriceSource,
}

async fn silver_price(State(state): State<Arc<AppState>>) -> Json<SilverPriceResponse> {
    let spot = state.cache.spot_price(Utc::now()).await;
    Json(SilverPriceResponse {
        success: true,
        silver_price: spot.price,
        currency: state.currency.clone(),
        unit: "troy_ounce",
        timestamp: spot.fetched_at.timestamp_millis(),
        source: spot.source,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SharePriceResponse {
    success: bool,
    share_price: f64,
    base_price: f64,
    silver_price: f64,
    currency: String,
    timestamp: i64,
    source: String,
}

async fn share_price(State(state): State<Arc<AppState>>) -> Json<SharePriceResponse> {
    let params = state.fund_parameters().await;
    let spot = state.cache.spot_price(Utc::now()).await;
    let share_price = compute_share_price(&params, spot.price);

    Json(SharePriceResponse {
        success: true,
        share_price,
        base_price: params.base_share_price,
        silver_price: spot.price,
        currency: state.currency.clone(),
        timestamp: Utc::now().timestamp_millis(),
        source: format!("calculated_from_{}", spot.source),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexPriceResponse {
    success: bool,
    actual_price: f64,
    normalized_price: f64,
    baseline_price: f64,
    timestamp: i64,
    source: &'static str,
}

async fn index_price(State(state): State<Arc<AppState>>) -> Json<IndexPriceResponse> {
    let (actual_price, normalized_price, source) = match state.index.fetch_index(Utc::now()).await {
        Ok(snapshot) => (snapshot.actual_price, snapshot.normalized_price, "yahoo"),
        Err(err) => {
            warn!(error = %err, "index price fetch failed, serving fallback");
            (
                SP500_FALLBACK_PRICE,
                SP500_FALLBACK_PRICE / SP500_BASELINE,
                "fallback",
            )
        }
    };

    Json(IndexPriceResponse {
        success: true,
        actual_price,
        normalized_price,
        baseline_price: SP500_BASELINE,
        timestamp: Utc::now().timestamp_millis(),
        source,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FundParamsResponse {
    success: bool,
    base_fund_value: f64,
    commodity_units: f64,
    reference_unit_price: f64,
    base_share_price: f64,
    last_updated: String,
}

impl From<FundParameters> for FundParamsResponse {
    fn from(params: FundParameters) -> Self {
        FundParamsResponse {
            success: true,
            base_fund_value: params.base_fund_value,
            commodity_units: params.commodity_units,
            reference_unit_price: params.reference_unit_price,
            base_share_price: params.base_share_price,
            last_updated: params.last_updated.to_rfc3339(),
        }
    }
}

/// "Not configured" is a valid state: the fallback parameters are returned,
/// never an error.
async fn get_fund_params(State(state): State<Arc<AppState>>) -> Json<FundParamsResponse> {
    let params = state.fund_parameters().await;
    Json(params.into())
}

async fn update_fund_params(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<FundParamsResponse>> {
    require_admin(&headers)?;

    let base_fund_value = number_field(&body, "baseFundValue")?;
    let commodity_units = number_field(&body, "commodityUnits")?;
    let reference_unit_price = number_field(&body, "referenceUnitPrice")?;
    let base_share_price = optional_number_field(&body, "baseSharePrice")?;

    if commodity_units < 0.0 {
        return Err(ApiError::BadRequest(
            "commodityUnits must not be negative".to_string(),
        ));
    }
    if let Some(price) = base_share_price {
        if price <= 0.0 {
            return Err(ApiError::BadRequest(
                "baseSharePrice must be positive".to_string(),
            ));
        }
    }
    // The derived share count must stay positive.
    if base_fund_value + commodity_units * reference_unit_price <= 0.0 {
        return Err(ApiError::BadRequest(
            "reference fund value must be positive".to_string(),
        ));
    }

    let update = ParamUpdate {
        base_fund_value: Some(base_fund_value),
        commodity_units: Some(commodity_units),
        reference_unit_price: Some(reference_unit_price),
        base_share_price,
    };

    let params = state.params_store().update_params(update).await?;
    Ok(Json(params.into()))
}

fn require_admin(headers: &HeaderMap) -> Result<(), ApiError> {
    let cookies = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let authed = cookies.split(';').map(str::trim).any(|pair| {
        pair.strip_prefix(ADMIN_COOKIE)
            .and_then(|rest| rest.strip_prefix('='))
            .is_some_and(|token| !token.is_empty())
    });

    if authed {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("admin session required".to_string()))
    }
}

fn number_field(body: &Value, name: &str) -> Result<f64, ApiError> {
    optional_number_field(body, name)?
        .ok_or_else(|| ApiError::BadRequest(format!("{name} is required")))
}

fn optional_number_field(body: &Value, name: &str) -> Result<Option<f64>, ApiError> {
    match body.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("{name} must be a finite number"))),
        Some(_) => Err(ApiError::BadRequest(format!("{name} must be a number"))),
    }
}
