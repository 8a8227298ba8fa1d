//! HTTP boundary: the axum router, request/response DTOs, and the handlers
//! that translate wire calls into `Engine` calls. Everything here is a thin
//! translation layer — validation and matching both live in `engine`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::auth::{AdminAuth, BrokerAuth};
use crate::engine::Engine;
use crate::errors::ExchangeError;
use crate::model::{BrokerId, Order, OrderId, OrderType, Side, Trade};
use crate::persistence::{self, FlushLoopHandle};
use crate::store::Store;

/// Everything a handler needs: the engine, the store (for the debug reset's
/// truncate and nothing else — reads and writes on the hot/cold paths go
/// through the engine), the admin secret, and a handle on the recyclable
/// flush loop.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn Store>,
    pub admin_api_key: Option<String>,
    pub webhook_client: reqwest::Client,
    pub webhook_timeout: Duration,
    pub flush_interval: Duration,
    pub flush_loop: Arc<tokio::sync::Mutex<Option<FlushLoopHandle>>>,
}

// ---------------------------------------------------------------- register

#[derive(Deserialize)]
pub struct RegisterRequest {
    name: String,
    webhook_url: Option<String>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    broker_id: BrokerId,
    api_key: String,
}

pub async fn register(
    _admin: AdminAuth,
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ExchangeError> {
    let (broker, api_key) = state.engine.register_broker(req.name, req.webhook_url).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            broker_id: broker.id,
            api_key,
        }),
    ))
}

// ----------------------------------------------------------------- balance

#[derive(Serialize)]
pub struct BalanceResponse {
    broker_id: BrokerId,
    broker_name: String,
    balance: i64,
}

pub async fn get_balance(
    BrokerAuth(broker_id): BrokerAuth,
    State(state): State<AppState>,
) -> Result<Json<BalanceResponse>, ExchangeError> {
    let (broker_name, balance) = state
        .engine
        .broker_snapshot(broker_id)
        .ok_or_else(|| ExchangeError::NotFound(format!("broker {broker_id}")))?;
    Ok(Json(BalanceResponse {
        broker_id,
        broker_name,
        balance,
    }))
}

// ------------------------------------------------------------------ orders

/// `POST /orders` body. `valid_until` is required for limit orders and
/// ignored for market orders (the engine sets it to `created_at`).
#[derive(Deserialize)]
pub struct OrderCreate {
    document_number: String,
    side: Side,
    order_type: OrderType,
    symbol: String,
    price: Option<i64>,
    quantity: i64,
    valid_until: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct OrderCreateResponse {
    order_id: OrderId,
}

pub async fn create_order(
    BrokerAuth(broker_id): BrokerAuth,
    State(state): State<AppState>,
    Json(req): Json<OrderCreate>,
) -> Result<(StatusCode, Json<OrderCreateResponse>), ExchangeError> {
    let now = Utc::now();
    let valid_until = match req.order_type {
        OrderType::Market => now,
        OrderType::Limit => req
            .valid_until
            .ok_or_else(|| ExchangeError::Validation("limit orders require valid_until".into()))?,
    };
    if req.order_type == OrderType::Limit && valid_until <= now {
        return Err(ExchangeError::Validation(
            "valid_until must be strictly in the future".into(),
        ));
    }

    let outcome = state.engine.submit_order(
        broker_id,
        req.document_number,
        req.symbol.to_uppercase(),
        req.side,
        req.order_type,
        req.price,
        req.quantity,
        valid_until,
    )?;

    Ok((
        StatusCode::CREATED,
        Json(OrderCreateResponse {
            order_id: outcome.order.id,
        }),
    ))
}

#[derive(Serialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    order: Order,
    trades: Vec<Trade>,
}

pub async fn get_order(
    BrokerAuth(broker_id): BrokerAuth,
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<OrderDetail>, ExchangeError> {
    let found = state.engine.get_order(broker_id, order_id).await?;
    Ok(Json(OrderDetail {
        order: found.order,
        trades: found.trades,
    }))
}

pub async fn cancel_order(
    BrokerAuth(broker_id): BrokerAuth,
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> Result<StatusCode, ExchangeError> {
    state.engine.cancel_order(broker_id, order_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ------------------------------------------------------------------- book

fn default_depth() -> usize {
    10
}

#[derive(Deserialize)]
pub struct BookQuery {
    #[serde(default = "default_depth")]
    depth: usize,
}

#[derive(Serialize)]
pub struct LevelDto {
    price: i64,
    total_quantity: i64,
    order_count: usize,
}

#[derive(Serialize)]
pub struct BookResponse {
    symbol: String,
    depth: usize,
    asks: Vec<LevelDto>,
    bids: Vec<LevelDto>,
}

pub async fn get_book(
    BrokerAuth(_broker_id): BrokerAuth,
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(q): Query<BookQuery>,
) -> Result<Json<BookResponse>, ExchangeError> {
    if !(1..=50).contains(&q.depth) {
        return Err(ExchangeError::Validation("depth must be between 1 and 50".into()));
    }
    let depth = q.depth;
    let symbol = symbol.to_uppercase();
    let (bids, asks) = state.engine.book_depth(&symbol, depth);
    let to_dto = |levels: Vec<crate::orderbook::LevelSummary>| {
        levels
            .into_iter()
            .map(|l| LevelDto {
                price: l.price,
                total_quantity: l.total_quantity,
                order_count: l.order_count,
            })
            .collect()
    };
    Ok(Json(BookResponse {
        symbol,
        depth,
        asks: to_dto(asks),
        bids: to_dto(bids),
    }))
}

// ------------------------------------------------------------------ price

fn default_trades() -> usize {
    50
}

#[derive(Deserialize)]
pub struct PriceQuery {
    #[serde(default = "default_trades", rename = "trades")]
    trades_in_average: usize,
}

#[derive(Serialize)]
pub struct PriceResponse {
    symbol: String,
    last_price: i64,
    average_price: i64,
    trades_in_average: usize,
}

pub async fn get_price(
    BrokerAuth(_broker_id): BrokerAuth,
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(q): Query<PriceQuery>,
) -> Result<Json<PriceResponse>, ExchangeError> {
    if !(1..=1000).contains(&q.trades_in_average) {
        return Err(ExchangeError::Validation(
            "trades must be between 1 and 1000".into(),
        ));
    }
    let symbol = symbol.to_uppercase();
    let count = q.trades_in_average;
    let (average_price, trades_in_average) = state
        .engine
        .stock_price(&symbol, count)
        .ok_or_else(|| ExchangeError::NotFound(format!("no trades for {symbol}")))?;
    let (last_price, _) = state
        .engine
        .stock_price(&symbol, 1)
        .expect("average_price succeeded so the ring is non-empty");
    Ok(Json(PriceResponse {
        symbol,
        last_price,
        average_price,
        trades_in_average,
    }))
}

// ------------------------------------------------------------------- debug

/// Stop the flush loop, wipe memory and the durable store, then start a
/// fresh loop over a fresh queue. Only ever used by test fixtures and demo
/// environments — a real broker session never touches this.
pub async fn debug_reset(
    _admin: AdminAuth,
    State(state): State<AppState>,
) -> Result<StatusCode, ExchangeError> {
    let mut guard = state.flush_loop.lock().await;
    let old = guard
        .take()
        .expect("flush loop handle is only absent mid-reset, under this same lock");
    old.stop().await;

    state.engine.clear();
    state.store.reset().await?;

    let (tx, rx) = persistence::channel();
    state.engine.set_persistence_sender(tx);
    let fresh = persistence::spawn_flush_loop(
        state.engine.clone(),
        state.store.clone(),
        rx,
        state.webhook_client.clone(),
        state.webhook_timeout,
        state.flush_interval,
    );
    *guard = Some(fresh);

    Ok(StatusCode::OK)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/balance", get(get_balance))
        .route("/orders", post(create_order))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/cancel", post(cancel_order))
        .route("/stocks/{symbol}/book", get(get_book))
        .route("/stocks/{symbol}/price", get(get_price))
        .route("/debug/reset", post(debug_reset))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .include_headers(false)
                        .level(tracing::Level::INFO),
                )
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}
