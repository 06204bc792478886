//! HTTP API for the presentation layer: health, orders, swap status and events
//!
//! Nothing here changes a swap's state directly. Cancels and recoveries are
//! requests to the engine, which the swap's orchestrator may refuse.

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::coordination::{EngineStats, Order, OrderRequest, Recovery, SwapEngine};
use crate::error::{SwapError, SwapResult};
use crate::store::SwapStore;
use crate::swap::SwapSnapshot;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SwapEngine>,
    pub chains: Arc<ChainManager>,
    pub store: Arc<dyn SwapStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .route("/orders", post(place_order).delete(cancel_orders))
        .route("/orders/:id", delete(cancel_order))
        .route("/swaps/:id", get(swap_status))
        .route("/swaps/:id/history", get(swap_history))
        .route("/swaps/:id/recover", post(recover_funds))
        .route("/events", get(events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SwapResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Engine errors as HTTP responses
pub struct ApiError(SwapError);

impl From<SwapError> for ApiError {
    fn from(e: SwapError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SwapError::SwapNotFound(_) | SwapError::OrderNotFound(_) | SwapError::CoinNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            SwapError::NotCancelable { .. } | SwapError::Refund(_) => StatusCode::CONFLICT,
            SwapError::Validation(_) => StatusCode::BAD_REQUEST,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            kind: self.0.kind(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - swap store and every coin backend
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();
    let coin_health = state.chains.health_check().await;
    let coins_ok = coin_health.iter().all(|(_, healthy)| *healthy);
    let ready = store_ok && coins_ok;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            store: store_ok,
            coins: coins_ok,
            details: coin_health
                .into_iter()
                .map(|(coin, healthy)| CoinHealth { coin, healthy })
                .collect(),
        }),
    )
}

async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChainsResponse {
        coins: state.chains.connected_coins(),
    })
}

async fn get_stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}

async fn place_order(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> ApiResult<Order> {
    Ok(Json(state.engine.place_order(request).await?))
}

async fn cancel_order(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<CancelResponse> {
    state.engine.cancel_order(id).await?;
    Ok(Json(CancelResponse { cancelled: vec![id] }))
}

#[derive(Deserialize)]
struct CancelQuery {
    ticker: Option<String>,
}

async fn cancel_orders(
    State(state): State<AppState>,
    Query(query): Query<CancelQuery>,
) -> Json<CancelResponse> {
    let cancelled = match query.ticker {
        Some(ticker) => state.engine.cancel_all_orders_by_ticker(&ticker).await,
        None => state.engine.cancel_all_orders().await,
    };
    Json(CancelResponse { cancelled })
}

async fn swap_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<SwapSnapshot> {
    Ok(Json(state.engine.swap_status(id).await?))
}

async fn swap_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<SwapSnapshot>> {
    Ok(Json(state.engine.swap_history(id).await?))
}

async fn recover_funds(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Recovery> {
    Ok(Json(state.engine.recover_funds(id).await?))
}

/// Swap status changes as server-sent events
async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.engine.subscribe();
    let stream = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let event = Event::default()
                        .event("swap_status")
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().comment("unserializable event"));
                    return Some((Ok(event), receiver));
                }
                Err(RecvError::Lagged(missed)) => warn!("Event stream lagged by {} events", missed),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    coins: bool,
    details: Vec<CoinHealth>,
}

#[derive(Serialize)]
struct CoinHealth {
    coin: String,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainsResponse {
    coins: Vec<String>,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: Vec<Uuid>,
}

#[derive(Serialize)]
struct ErrorResponse {
    kind: crate::error::ErrorKind,
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::{SimulatedChain, SimulatedWallet};
    use crate::config::{CoinFamily, EngineConfig};
    use crate::negotiation::LocalTransport;
    use crate::store::FileSwapStore;
    use crate::swap::ConfirmationSettings;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app(dir: &tempfile::TempDir) -> Router {
        let chains = Arc::new(ChainManager::new(Duration::from_millis(50)));
        for ticker in ["BASE", "REL"] {
            let chain = Arc::new(SimulatedChain::new(ticker, CoinFamily::Utxo, 60));
            chains.register(
                Arc::new(SimulatedWallet::new(chain, "api-test")),
                ConfirmationSettings {
                    confirmations: 1,
                    protected: false,
                    protected_confirmations: 1,
                },
            );
        }
        let store: Arc<dyn SwapStore> = Arc::new(FileSwapStore::open(dir.path()).await.unwrap());
        let engine = Arc::new(SwapEngine::new(
            chains.clone(),
            store.clone(),
            Arc::new(LocalTransport::new()),
            EngineConfig::default(),
        ));
        router(AppState { engine, chains, store })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_order_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let order = serde_json::json!({
            "base": "BASE",
            "rel": "REL",
            "volume": 100_000_000u64,
            "price": { "numer": 500, "denom": 1 },
        });
        let (status, placed) = send(&app, "POST", "/orders", Some(order)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(placed["rel_amount"], 50_000_000_000u64);

        let (_, stats) = send(&app, "GET", "/stats", None).await;
        assert_eq!(stats["orders_open"], 1);

        let id = placed["id"].as_str().unwrap().to_string();
        let (status, cancelled) = send(&app, "DELETE", &format!("/orders/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["cancelled"][0], id);

        let (status, _) = send(&app, "DELETE", &format!("/orders/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_coin_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let order = serde_json::json!({
            "base": "NOPE",
            "rel": "REL",
            "volume": 1,
            "price": { "numer": 1, "denom": 1 },
        });
        let (status, body) = send(&app, "POST", "/orders", Some(order)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("NOPE"));

        let (status, _) = send(&app, "GET", &format!("/swaps/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, health) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "ok");
    }
}
