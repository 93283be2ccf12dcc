use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::application::actors::engine_registry::EngineRegistry;
use crate::application::actors::execution_engine::{
    EngineStatus, OrderExecutionEngine, SignalOutcome,
};
use crate::domain::entities::position::Position;
use crate::domain::entities::signal::Signal;
use crate::domain::errors::EngineError;
use crate::domain::services::error_handler::ErrorSummary;
use crate::domain::services::order_throttle::ThrottleSnapshot;
use crate::rate_limit::{rate_limit_middleware, GlobalRateLimiter};

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Signal bodies are a few hundred bytes
const MAX_BODY_BYTES: usize = 16 * 1024;

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub engines: Vec<EngineStatus>,
}

/// Open position with its latest mark
#[derive(Debug, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    pub last_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignalResponse {
    /// "opened", "rejected" or "abandoned"
    pub outcome: String,
    pub symbol: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseResponse {
    pub symbol: String,
    pub exit_price: f64,
    pub realized_pnl: f64,
}

/// Status and manual override routes, rate limited and traced
pub fn router(registry: EngineRegistry, limiter: GlobalRateLimiter) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/accounts/:account_id/positions", get(get_positions))
        .route("/accounts/:account_id/errors", get(get_errors))
        .route("/accounts/:account_id/throttle", get(get_throttle))
        .route("/accounts/:account_id/signals", post(submit_signal))
        .route(
            "/accounts/:account_id/positions/:symbol/close",
            post(close_position),
        )
        .with_state(registry)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn engine_for(
    registry: &EngineRegistry,
    account_id: &str,
) -> Result<Arc<OrderExecutionEngine>, ApiError> {
    registry.get(account_id).await.ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Unknown account: {}", account_id),
        )
    })
}

/// Liveness plus a status line per engine
pub async fn health(State(registry): State<EngineRegistry>) -> Json<HealthResponse> {
    let mut engines = Vec::new();
    for account_id in registry.accounts().await {
        if let Some(engine) = registry.get(&account_id).await {
            engines.push(engine.status());
        }
    }
    let status = if engines.iter().any(|e| !e.accepting_signals) {
        "degraded"
    } else {
        "running"
    };
    Json(HealthResponse {
        status: status.to_string(),
        engines,
    })
}

pub async fn get_positions(
    State(registry): State<EngineRegistry>,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<PositionView>>, ApiError> {
    let engine = engine_for(&registry, &account_id).await?;
    let mut positions: Vec<PositionView> = engine
        .positions()
        .get_all_positions()
        .into_iter()
        .map(|position| {
            let last_price = engine.last_price(&position.instrument);
            PositionView {
                unrealized_pnl: last_price.map(|price| position.unrealized_pnl(price)),
                last_price,
                position,
            }
        })
        .collect();
    positions.sort_by(|a, b| a.position.symbol.cmp(&b.position.symbol));
    Ok(Json(positions))
}

pub async fn get_errors(
    State(registry): State<EngineRegistry>,
    Path(account_id): Path<String>,
) -> Result<Json<ErrorSummary>, ApiError> {
    let engine = engine_for(&registry, &account_id).await?;
    Ok(Json(engine.error_summary()))
}

pub async fn get_throttle(
    State(registry): State<EngineRegistry>,
    Path(account_id): Path<String>,
) -> Result<Json<ThrottleSnapshot>, ApiError> {
    let engine = engine_for(&registry, &account_id).await?;
    Ok(Json(engine.throttle().snapshot()))
}

/// Inject a signal directly, bypassing the strategy source
pub async fn submit_signal(
    State(registry): State<EngineRegistry>,
    Path(account_id): Path<String>,
    Json(signal): Json<Signal>,
) -> Result<Json<SignalResponse>, ApiError> {
    let engine = engine_for(&registry, &account_id).await?;
    let symbol = signal.symbol().to_string();
    let response = match engine.submit_signal(signal).await {
        SignalOutcome::Opened(_) => SignalResponse {
            outcome: "opened".to_string(),
            symbol,
            reason: None,
        },
        SignalOutcome::Rejected(reason) => SignalResponse {
            outcome: "rejected".to_string(),
            symbol,
            reason: Some(reason),
        },
        SignalOutcome::Abandoned(reason) => SignalResponse {
            outcome: "abandoned".to_string(),
            symbol,
            reason: Some(reason),
        },
    };
    Ok(Json(response))
}

/// Manual override: flatten one position at market
pub async fn close_position(
    State(registry): State<EngineRegistry>,
    Path((account_id, symbol)): Path<(String, String)>,
) -> Result<Json<CloseResponse>, ApiError> {
    let engine = engine_for(&registry, &account_id).await?;
    if !engine.positions().has_position(&symbol) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No open position for {}", symbol),
        ));
    }

    match engine.close_position(&symbol).await {
        Ok(trade) => Ok(Json(CloseResponse {
            symbol,
            exit_price: trade.exit_price,
            realized_pnl: trade.realized_pnl,
        })),
        Err(EngineError::InvalidSignal(reason)) => Err(api_error(StatusCode::CONFLICT, reason)),
        Err(e) => Err(api_error(StatusCode::BAD_GATEWAY, e.to_string())),
    }
}
