//! Read-only HTTP API for health, status and order queries

use crate::chain::Chain;
use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{ActionRecord, Fill, LegObservation, Order, OrderStatus};
use crate::supervisor::{Relayer, RelayerStatus};
use crate::types::{Hashlock, Secret};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub relayer: Arc<Relayer>,
}

pub fn router(relayer: Arc<Relayer>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/orders", get(list_orders))
        .route("/orders/:order_id", get(get_order))
        .route("/orders/hashlock/:hashlock", get(get_orders_by_hashlock))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { relayer })
}

/// Run the HTTP API server until cancelled
pub async fn run_server(
    config: ApiConfig,
    relayer: Arc<Relayer>,
    cancel: CancellationToken,
) -> RelayerResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(relayer))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

/// Error body returned by every handler
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

struct ApiError(StatusCode, ErrorBody);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(
            StatusCode::BAD_REQUEST,
            ErrorBody {
                error: message.into(),
                kind: "bad_request",
            },
        )
    }
}

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        let status = match &e {
            RelayerError::OrderNotFound { .. } => StatusCode::NOT_FOUND,
            RelayerError::InvalidOrder(_) | RelayerError::InvalidFill { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(
            status,
            ErrorBody {
                error: e.to_string(),
                kind: e.kind(),
            },
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

/// Public view of an order; the creator's secret is never exposed
#[derive(Debug, Serialize)]
pub struct OrderView {
    pub order_id: String,
    pub hashlock: Hashlock,
    pub status: OrderStatus,
    pub terminal: bool,
    #[serde(serialize_with = "crate::types::amount::serialize")]
    pub total_amount: u128,
    #[serde(serialize_with = "crate::types::amount::serialize")]
    pub remaining_amount: u128,
    #[serde(serialize_with = "crate::types::amount::serialize")]
    pub min_fill_amount: u128,
    #[serde(serialize_with = "crate::types::amount::serialize")]
    pub max_fill_amount: u128,
    pub recipient_address: String,
    pub refund_address: String,
    pub locktime: u64,
    pub network: String,
    pub chain: Chain,
    pub bitcoin: LegObservation,
    pub ethereum: LegObservation,
    /// Already public on chain once set
    pub revealed_secret: Option<Secret>,
    pub fills: Vec<Fill>,
    pub actions: BTreeMap<String, ActionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        Self {
            status: order.status(),
            terminal: order.is_terminal(),
            order_id: order.order_id,
            hashlock: order.hashlock,
            total_amount: order.total_amount,
            remaining_amount: order.remaining_amount,
            min_fill_amount: order.min_fill_amount,
            max_fill_amount: order.max_fill_amount,
            recipient_address: order.recipient_address,
            refund_address: order.refund_address,
            locktime: order.locktime,
            network: order.network,
            chain: order.chain,
            bitcoin: order.bitcoin,
            ethereum: order.ethereum,
            revealed_secret: order.revealed_secret,
            fills: order.fills,
            actions: order.actions,
            created_at: order.created_at,
            updated_at: order.updated_at,
            archived_at: order.archived_at,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    running: bool,
    watchers_connected: bool,
}

/// Liveness plus a coarse readiness signal
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.relayer.status().await;
    let watchers_connected = status.watchers.iter().all(|w| w.connected);
    let healthy = status.running && watchers_connected;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            running: status.running,
            watchers_connected,
        }),
    )
}

async fn get_status(State(state): State<AppState>) -> Json<RelayerStatus> {
    Json(state.relayer.status().await)
}

#[derive(Debug, Deserialize)]
struct OrdersQuery {
    status: Option<String>,
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<Vec<OrderView>>, ApiError> {
    let store = state.relayer.store();
    let orders = match query.status.as_deref() {
        Some(raw) => {
            let status: OrderStatus = raw.parse().map_err(ApiError::bad_request)?;
            store.find_by_status(status).await
        }
        None => store.list().await,
    };
    Ok(Json(orders.into_iter().map(OrderView::from).collect()))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    let order = state
        .relayer
        .store()
        .get(&order_id)
        .await
        .ok_or(RelayerError::OrderNotFound { order_id })?;
    Ok(Json(order.into()))
}

async fn get_orders_by_hashlock(
    State(state): State<AppState>,
    Path(hashlock): Path<String>,
) -> Result<Json<Vec<OrderView>>, ApiError> {
    let hashlock: Hashlock = hashlock.parse().map_err(ApiError::bad_request)?;
    let orders = state.relayer.store().find_by_hashlock(&hashlock).await;
    Ok(Json(orders.into_iter().map(OrderView::from).collect()))
}
