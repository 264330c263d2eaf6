//! HTTP surface: entry submission, oracle snapshots, the settlement
//! trigger, and the status endpoints.

use axum::{
    extract::{ConnectInfo, Query, State},
    http::HeaderMap,
    middleware as axum_mw,
    response::Json,
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

use crate::api::error::ApiError;
use crate::engine::join::JoinHandler;
use crate::engine::ledger::Ledger;
use crate::engine::oracle::OraclePort;
use crate::engine::settlement::SettlementEngine;
use crate::middleware::{rate_limit_middleware, request_logging, RateLimitLayer};
use crate::models::{
    Config, JoinRequest, JoinResponse, MarketSymbol, OracleResponse, SettleResponse, StatusResponse,
};

/// Rounds listed in the authenticated health detail.
const OPS_DETAIL_LIMIT: usize = 32;

/// Rounds scanned when computing status counters.
const STATUS_SCAN_LIMIT: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Arc<dyn Ledger>,
    pub oracle: Arc<OraclePort>,
    pub join: Arc<JoinHandler>,
    pub engine: Arc<SettlementEngine>,
    status_cache: Arc<Mutex<Option<(Instant, StatusResponse)>>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        ledger: Arc<dyn Ledger>,
        oracle: Arc<OraclePort>,
        join: Arc<JoinHandler>,
        engine: Arc<SettlementEngine>,
    ) -> Self {
        Self {
            config,
            ledger,
            oracle,
            join,
            engine,
            status_cache: Arc::new(Mutex::new(None)),
        }
    }
}

/// Build the public router with logging and per-IP rate limiting.
pub fn create_router(state: AppState, limiter: RateLimitLayer) -> Router {
    Router::new()
        .route("/entries", post(post_entry))
        .route("/oracle", get(get_oracle))
        .route("/settle", post(post_settle))
        .route("/status", get(get_status))
        .route("/ops/health", get(get_ops_health))
        .layer(axum_mw::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(axum_mw::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

async fn post_entry(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let created = state
        .join
        .handle(&payload, &addr.ip().to_string(), now_ms)
        .await?;
    Ok(Json(JoinResponse { ok: true, created }))
}

#[derive(Deserialize)]
struct OracleQuery {
    market: String,
}

async fn get_oracle(
    State(state): State<AppState>,
    Query(params): Query<OracleQuery>,
) -> Result<Json<OracleResponse>, ApiError> {
    let symbol = MarketSymbol::parse(&params.market)
        .ok_or_else(|| ApiError::Validation("unknown market".to_string()))?;
    let market = state
        .config
        .market(symbol)
        .ok_or_else(|| ApiError::Validation("unknown market".to_string()))?;

    let now = chrono::Utc::now().timestamp();
    let snapshot = state
        .oracle
        .price_at(market, now)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;

    let scale = 10f64.powi(snapshot.expo);
    Ok(Json(OracleResponse {
        market: symbol.as_str().to_string(),
        asset: symbol.asset().to_string(),
        source: "pyth".to_string(),
        feed_id: market.feed_id.clone(),
        price: snapshot.price as f64 * scale,
        confidence: snapshot.confidence as f64 * scale,
        publish_time: snapshot.publish_time,
        fetched_at: now,
    }))
}

async fn post_settle(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SettleResponse>, ApiError> {
    let presented = headers
        .get("x-settle-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Auth)?;
    let expected = state.config.settle_key.as_deref().ok_or(ApiError::Auth)?;
    if !constant_time_eq(presented, expected) {
        return Err(ApiError::Auth);
    }

    if state.config.gates.settle_paused {
        return Err(ApiError::Paused);
    }
    // Simulation deployments gate the simulated settlement path separately.
    if state.config.escrow_wallet.is_none() && state.config.gates.sim_settle_paused {
        return Err(ApiError::Paused);
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let settled = state
        .engine
        .settle_due_rounds(now_ms.div_euclid(1000), now_ms)
        .await?;
    Ok(Json(SettleResponse { ok: true, settled }))
}

async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let cache_for = std::time::Duration::from_millis(state.config.status_cache_ms);
    if let Some((at, cached)) = state.status_cache.lock().as_ref() {
        if at.elapsed() < cache_for {
            return Ok(Json(cached.clone()));
        }
    }

    let status = build_status(&state, false)?;
    *state.status_cache.lock() = Some((Instant::now(), status.clone()));
    Ok(Json(status))
}

async fn get_ops_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    let presented = headers
        .get("x-ops-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Auth)?;
    let expected = state.config.ops_key.as_deref().ok_or(ApiError::Auth)?;
    if !constant_time_eq(presented, expected) {
        return Err(ApiError::Auth);
    }

    Ok(Json(build_status(&state, true)?))
}

fn build_status(state: &AppState, with_detail: bool) -> Result<StatusResponse, ApiError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let now = now_ms.div_euclid(1000);
    let stats = state
        .ledger
        .due_stats(now, now_ms, STATUS_SCAN_LIMIT)
        .map_err(ApiError::Internal)?;

    let gates = state.config.gates;
    let cycle_ms = (state.config.open_seconds + state.config.lock_seconds) * 1000;
    let status = if gates.joins_paused || gates.settle_paused {
        "paused"
    } else if stats.max_settlement_lag_ms > cycle_ms * 2 {
        "degraded"
    } else {
        "ok"
    };

    let due_rounds = if with_detail {
        let due = state
            .ledger
            .rounds_due(now, OPS_DETAIL_LIMIT)
            .map_err(ApiError::Internal)?;
        Some(due.iter().map(|r| r.id()).collect())
    } else {
        None
    };

    Ok(StatusResponse {
        ok: status == "ok",
        status: status.to_string(),
        joins_paused: gates.joins_paused,
        settlement_paused: gates.settle_paused,
        pending_due_rounds: stats.pending_due_rounds,
        max_settlement_lag_ms: stats.max_settlement_lag_ms,
        updated_at_ms: now_ms,
        due_rounds,
    })
}

/// Constant-time secret comparison: compare fixed-length digests with a
/// full-width fold so neither length nor prefix leaks through timing.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    da.iter().zip(db.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(!constant_time_eq("secret", ""));
        assert!(constant_time_eq("", ""));
    }
}
