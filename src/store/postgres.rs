//! Production `Store`: Postgres via sqlx, one connection pool, migrations
//! run once at startup before anything else touches the database.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::model::{Broker, BrokerId, Order, OrderId, OrderStatus, OrderType, Side, Trade};

use super::{BatchWrite, Store, StoreError};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            StoreError::Database(format!("migration failed: {e}"))
        })?;
        Ok(Self { pool })
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Bid => "bid",
        Side::Ask => "ask",
    }
}

fn parse_side(s: &str) -> Result<Side, StoreError> {
    match s {
        "bid" => Ok(Side::Bid),
        "ask" => Ok(Side::Ask),
        other => Err(StoreError::Database(format!("unrecognized side {other}"))),
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Limit => "limit",
        OrderType::Market => "market",
    }
}

fn parse_order_type(s: &str) -> Result<OrderType, StoreError> {
    match s {
        "limit" => Ok(OrderType::Limit),
        "market" => Ok(OrderType::Market),
        other => Err(StoreError::Database(format!("unrecognized order_type {other}"))),
    }
}

fn status_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::Open => "open",
        OrderStatus::Closed => "closed",
    }
}

fn parse_status(s: &str) -> Result<OrderStatus, StoreError> {
    match s {
        "open" => Ok(OrderStatus::Open),
        "closed" => Ok(OrderStatus::Closed),
        other => Err(StoreError::Database(format!("unrecognized status {other}"))),
    }
}

fn order_from_row(row: &sqlx::postgres::PgRow) -> Result<Order, StoreError> {
    Ok(Order {
        id: row.try_get("id")?,
        broker_id: row.try_get("broker_id")?,
        symbol: row.try_get("symbol")?,
        side: parse_side(row.try_get::<String, _>("side")?.as_str())?,
        order_type: parse_order_type(row.try_get::<String, _>("order_type")?.as_str())?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        remaining_quantity: row.try_get("remaining_quantity")?,
        status: parse_status(row.try_get::<String, _>("status")?.as_str())?,
        document_number: row.try_get("document_number")?,
        valid_until: row.try_get("valid_until")?,
        created_at: row.try_get("created_at")?,
    })
}

fn trade_from_row(row: &sqlx::postgres::PgRow) -> Result<Trade, StoreError> {
    Ok(Trade {
        id: row.try_get("id")?,
        buy_order_id: row.try_get("buy_order_id")?,
        sell_order_id: row.try_get("sell_order_id")?,
        symbol: row.try_get("symbol")?,
        price: row.try_get("price")?,
        quantity: row.try_get("quantity")?,
        buyer_broker_id: row.try_get("buyer_broker_id")?,
        seller_broker_id: row.try_get("seller_broker_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn broker_from_row(row: &sqlx::postgres::PgRow) -> Result<Broker, StoreError> {
    Ok(Broker {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        api_key_hash: row.try_get("api_key_hash")?,
        webhook_url: row.try_get("webhook_url")?,
        balance: row.try_get("balance")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_broker(&self, broker: &Broker) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO brokers (id, name, api_key_hash, webhook_url, balance) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(broker.id)
        .bind(&broker.name)
        .bind(&broker.api_key_hash)
        .bind(&broker.webhook_url)
        .bind(broker.balance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_batch(&self, batch: BatchWrite) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        for order in &batch.new_orders {
            sqlx::query(
                "INSERT INTO orders
                 (id, broker_id, document_number, side, order_type, symbol, price,
                  quantity, remaining_quantity, valid_until, status, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(order.id)
            .bind(order.broker_id)
            .bind(&order.document_number)
            .bind(side_str(order.side))
            .bind(order_type_str(order.order_type))
            .bind(&order.symbol)
            .bind(order.price)
            .bind(order.quantity)
            .bind(order.remaining_quantity)
            .bind(order.valid_until)
            .bind(status_str(order.status))
            .bind(order.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for trade in &batch.trades {
            sqlx::query(
                "INSERT INTO trades
                 (id, buy_order_id, sell_order_id, symbol, price, quantity,
                  buyer_broker_id, seller_broker_id, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(trade.id)
            .bind(trade.buy_order_id)
            .bind(trade.sell_order_id)
            .bind(&trade.symbol)
            .bind(trade.price)
            .bind(trade.quantity)
            .bind(trade.buyer_broker_id)
            .bind(trade.seller_broker_id)
            .bind(trade.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for update in &batch.order_updates {
            sqlx::query(
                "UPDATE orders SET status = $1, remaining_quantity = $2 WHERE id = $3",
            )
            .bind(status_str(update.status))
            .bind(update.remaining_quantity)
            .bind(update.order_id)
            .execute(&mut *tx)
            .await?;
        }

        for (broker_id, delta) in &batch.balance_deltas {
            sqlx::query("UPDATE brokers SET balance = balance + $1 WHERE id = $2")
                .bind(delta)
                .bind(broker_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_brokers(&self) -> Result<Vec<Broker>, StoreError> {
        let rows = sqlx::query("SELECT id, name, api_key_hash, webhook_url, balance FROM brokers")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(broker_from_row).collect()
    }

    async fn load_open_orders(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE status = 'open' AND valid_until > now() ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn load_trades_for_orders(&self, order_ids: &[OrderId]) -> Result<Vec<Trade>, StoreError> {
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE buy_order_id = ANY($1) OR sell_order_id = ANY($1)
             ORDER BY created_at ASC",
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn load_trades_for_order(&self, order_id: OrderId) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE buy_order_id = $1 OR sell_order_id = $1 ORDER BY created_at ASC",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn load_recent_prices(&self, limit: usize) -> Result<HashMap<String, Vec<i64>>, StoreError> {
        // `row_number` ranks each symbol's trades most-recent-first so the
        // outer query can cap at `limit` per symbol in one round trip; the
        // final ORDER BY restores chronological order within each symbol.
        let rows = sqlx::query(
            "SELECT symbol, price, created_at FROM (
                 SELECT symbol, price, created_at,
                        row_number() OVER (PARTITION BY symbol ORDER BY created_at DESC) AS rn
                 FROM trades
             ) ranked
             WHERE rn <= $1
             ORDER BY symbol, created_at ASC",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut by_symbol: HashMap<String, Vec<i64>> = HashMap::new();
        for row in &rows {
            let symbol: String = row.try_get("symbol")?;
            let price: i64 = row.try_get("price")?;
            by_symbol.entry(symbol).or_default().push(price);
        }
        Ok(by_symbol)
    }

    async fn trade_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT count(*) AS count FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn reset(&self) -> Result<(), StoreError> {
        sqlx::query("TRUNCATE trades, orders, brokers CASCADE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
