//! Deterministic startup load: rebuild every in-memory structure from the
//! durable store before the HTTP listener binds, so the first request ever
//! served sees the same state the process had right before it stopped.

use std::sync::Arc;

use crate::engine::Engine;
use crate::store::Store;

/// Order matters here: brokers first (orders reference them), then open
/// orders in `created_at` order (so re-inserting them into the book
/// reproduces the original FIFO queues), then the trades that touch those
/// orders (to rebuild the trades-by-order index and the recent-price
/// rings).
pub async fn restore(engine: &Arc<Engine>, store: &Arc<dyn Store>) -> anyhow::Result<()> {
    let brokers = store.load_brokers().await?;
    tracing::info!(count = brokers.len(), "loaded brokers");

    let orders = store.load_open_orders().await?;
    tracing::info!(count = orders.len(), "loaded open orders");

    let order_ids: Vec<_> = orders.iter().map(|o| o.id).collect();
    let trades = store.load_trades_for_orders(&order_ids).await?;
    tracing::info!(count = trades.len(), "loaded trades for open orders");

    let recent_prices = store.load_recent_prices(engine.price_ring_capacity()).await?;
    tracing::info!(symbols = recent_prices.len(), "loaded recent trade prices");

    engine.restore(brokers, orders, trades, recent_prices);
    Ok(())
}
