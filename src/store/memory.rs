//! In-memory `Store` double used by the integration test suite. Never
//! compiled into the shipped binary, never touches a socket or a file.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{Broker, BrokerId, Order, OrderId, Trade};

use super::{BatchWrite, Store, StoreError};

#[derive(Default)]
struct Inner {
    brokers: Vec<Broker>,
    orders: Vec<Order>,
    trades: Vec<Trade>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_broker(&self, broker: &Broker) -> Result<(), StoreError> {
        self.inner.lock().unwrap().brokers.push(broker.clone());
        Ok(())
    }

    async fn apply_batch(&self, batch: BatchWrite) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        for broker_id in batch.balance_deltas.iter().map(|(id, _)| id) {
            if !inner.brokers.iter().any(|b| &b.id == broker_id) {
                return Err(StoreError::BrokerNotFound(*broker_id));
            }
        }

        inner.orders.extend(batch.new_orders);
        inner.trades.extend(batch.trades);

        for update in &batch.order_updates {
            if let Some(o) = inner.orders.iter_mut().find(|o| o.id == update.order_id) {
                o.status = update.status;
                o.remaining_quantity = update.remaining_quantity;
            }
        }

        for (broker_id, delta) in &batch.balance_deltas {
            if let Some(b) = inner.brokers.iter_mut().find(|b| &b.id == broker_id) {
                b.balance += delta;
            }
        }

        Ok(())
    }

    async fn load_brokers(&self) -> Result<Vec<Broker>, StoreError> {
        Ok(self.inner.lock().unwrap().brokers.clone())
    }

    async fn load_open_orders(&self) -> Result<Vec<Order>, StoreError> {
        let now = chrono::Utc::now();
        let mut open: Vec<Order> = self
            .inner
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.status == crate::model::OrderStatus::Open && o.valid_until > now)
            .cloned()
            .collect();
        open.sort_by_key(|o| o.created_at);
        Ok(open)
    }

    async fn load_trades_for_orders(&self, order_ids: &[OrderId]) -> Result<Vec<Trade>, StoreError> {
        let mut trades: Vec<Trade> = self
            .inner
            .lock()
            .unwrap()
            .trades
            .iter()
            .filter(|t| order_ids.contains(&t.buy_order_id) || order_ids.contains(&t.sell_order_id))
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.created_at);
        Ok(trades)
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .cloned())
    }

    async fn load_trades_for_order(&self, order_id: OrderId) -> Result<Vec<Trade>, StoreError> {
        let mut trades: Vec<Trade> = self
            .inner
            .lock()
            .unwrap()
            .trades
            .iter()
            .filter(|t| t.buy_order_id == order_id || t.sell_order_id == order_id)
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.created_at);
        Ok(trades)
    }

    async fn load_recent_prices(&self, limit: usize) -> Result<HashMap<String, Vec<i64>>, StoreError> {
        let mut trades = self.inner.lock().unwrap().trades.clone();
        trades.sort_by_key(|t| t.created_at);

        let mut by_symbol: HashMap<String, Vec<i64>> = HashMap::new();
        for trade in trades {
            let prices = by_symbol.entry(trade.symbol.clone()).or_default();
            prices.push(trade.price);
            if prices.len() > limit {
                prices.remove(0);
            }
        }
        Ok(by_symbol)
    }

    async fn trade_count(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().unwrap().trades.len() as i64)
    }

    async fn reset(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.brokers.clear();
        inner.orders.clear();
        inner.trades.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderStatus, OrderType, Side};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn broker() -> Broker {
        Broker {
            id: Uuid::new_v4(),
            name: "acme".into(),
            api_key_hash: "hash".into(),
            webhook_url: None,
            balance: 0,
        }
    }

    fn order(broker_id: BrokerId) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            broker_id,
            symbol: "SYM".into(),
            side: Side::Bid,
            order_type: OrderType::Limit,
            price: Some(100),
            quantity: 10,
            remaining_quantity: 10,
            status: OrderStatus::Open,
            document_number: "doc".into(),
            valid_until: now + Duration::hours(1),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn apply_batch_updates_balance_by_delta() {
        let store = MemoryStore::new();
        let b = broker();
        store.insert_broker(&b).await.unwrap();

        let mut batch = BatchWrite::default();
        batch.balance_deltas.push((b.id, 500));
        store.apply_batch(batch).await.unwrap();

        let loaded = store.load_brokers().await.unwrap();
        assert_eq!(loaded[0].balance, 500);
    }

    #[tokio::test]
    async fn load_open_orders_excludes_expired_and_closed() {
        let store = MemoryStore::new();
        let b = broker();
        store.insert_broker(&b).await.unwrap();

        let mut open = order(b.id);
        let mut expired = order(b.id);
        expired.valid_until = Utc::now() - Duration::seconds(1);
        let mut closed = order(b.id);
        closed.status = OrderStatus::Closed;

        let mut batch = BatchWrite::default();
        batch.new_orders.push(open.clone());
        batch.new_orders.push(expired);
        batch.new_orders.push(closed);
        store.apply_batch(batch).await.unwrap();

        let loaded = store.load_open_orders().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, open.id);
        open.status = OrderStatus::Open;
    }

    #[tokio::test]
    async fn reset_clears_every_table() {
        let store = MemoryStore::new();
        let b = broker();
        store.insert_broker(&b).await.unwrap();
        store.reset().await.unwrap();
        assert!(store.load_brokers().await.unwrap().is_empty());
    }
}
