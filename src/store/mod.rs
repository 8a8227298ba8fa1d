//! The `Store` seam: everything synchronous order handling needs to survive
//! a restart, behind a trait so the flush loop and the HTTP handlers never
//! know whether they're talking to Postgres or to an in-memory fake.
//!
//! Two implementations live here: [`postgres::PostgresStore`] for
//! production, [`memory::MemoryStore`] for tests. Both are reached only
//! through `Arc<dyn Store>` — nothing outside this module names a concrete
//! type.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Broker, BrokerId, Order, OrderId, OrderStatus, Trade};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("broker {0} not found")]
    BrokerNotFound(BrokerId),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A snapshot of a field update applied to an already-persisted order.
/// Produced once per order id per flush, after keep-last deduplication —
/// never once per fill.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub remaining_quantity: i64,
}

/// Everything one flush tick writes, grouped the way the transaction needs
/// it ordered: new orders (satisfies trade and update foreign keys), then
/// trades, then updates, then balance deltas.
#[derive(Debug, Default)]
pub struct BatchWrite {
    pub new_orders: Vec<Order>,
    pub trades: Vec<Trade>,
    pub order_updates: Vec<OrderUpdate>,
    pub balance_deltas: Vec<(BrokerId, i64)>,
}

impl BatchWrite {
    pub fn is_empty(&self) -> bool {
        self.new_orders.is_empty()
            && self.trades.is_empty()
            && self.order_updates.is_empty()
            && self.balance_deltas.is_empty()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a freshly registered broker. Called synchronously at
    /// registration time, not through the flush loop — there's no matching
    /// to race against and the caller needs the write confirmed before
    /// handing back the raw API key.
    async fn insert_broker(&self, broker: &Broker) -> Result<(), StoreError>;

    /// Everything one flush tick collected, written as a single transaction.
    async fn apply_batch(&self, batch: BatchWrite) -> Result<(), StoreError>;

    /// All brokers, for the startup loader.
    async fn load_brokers(&self) -> Result<Vec<Broker>, StoreError>;

    /// Open, non-expired orders, oldest `created_at` first — the order the
    /// startup loader must replay them in to rebuild FIFO queues correctly.
    async fn load_open_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// Every trade touching any of `order_ids`, for rebuilding the
    /// trades-by-order index at startup.
    async fn load_trades_for_orders(&self, order_ids: &[OrderId]) -> Result<Vec<Trade>, StoreError>;

    /// The most recent `limit` trade prices per symbol, in chronological
    /// order, for seeding the startup price rings. Every symbol that has
    /// traded at least once gets an entry, even if it has no open orders.
    async fn load_recent_prices(&self, limit: usize) -> Result<HashMap<String, Vec<i64>>, StoreError>;

    /// An order no longer resident in memory, for the cold-path read.
    async fn load_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError>;

    /// Trades for a single order, for the cold-path read.
    async fn load_trades_for_order(&self, order_id: OrderId) -> Result<Vec<Trade>, StoreError>;

    /// Row count in the trades table, for the debug endpoint.
    async fn trade_count(&self) -> Result<i64, StoreError>;

    /// Truncate every table. Debug-only, never called from the hot path.
    async fn reset(&self) -> Result<(), StoreError>;
}
