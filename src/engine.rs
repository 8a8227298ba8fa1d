//! The engine: the single piece of mutable state the whole system shares,
//! and the only place that holds it under a lock.
//!
//! Every method that mutates book/orders/brokers does so inside one
//! `std::sync::Mutex` critical section with no `.await` in it — that's the
//! whole of the concurrency model. Nothing here runs on more than one
//! logical thread of control at a time; tokio still schedules the I/O
//! (HTTP, the store, webhooks) across its worker threads around these
//! short synchronous sections.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::ExchangeError;
use crate::matching;
use crate::model::{Broker, BrokerId, Order, OrderId, OrderStatus, OrderType, Side, Trade};
use crate::orderbook::{LevelSummary, OrderBook};
use crate::persistence::PersistenceItem;
use crate::store::Store;

pub struct EngineState {
    pub orders: HashMap<OrderId, Order>,
    pub book: OrderBook,
    pub brokers: HashMap<BrokerId, Broker>,
    pub brokers_by_key_hash: HashMap<String, BrokerId>,
    pub trades_by_order: HashMap<OrderId, Vec<Trade>>,
    pub price_rings: HashMap<String, VecDeque<i64>>,
}

impl EngineState {
    fn empty() -> Self {
        Self {
            orders: HashMap::new(),
            book: OrderBook::new(),
            brokers: HashMap::new(),
            brokers_by_key_hash: HashMap::new(),
            trades_by_order: HashMap::new(),
            price_rings: HashMap::new(),
        }
    }
}

/// What `submit_order` did, for the handler to turn into a response.
pub struct SubmitOutcome {
    pub order: Order,
    pub trades: Vec<Trade>,
}

/// The broker-facing view of an order plus its trades — what `get_order`
/// hands back regardless of whether it came from memory or the store.
pub struct OrderWithTrades {
    pub order: Order,
    pub trades: Vec<Trade>,
}

pub struct Engine {
    state: Mutex<EngineState>,
    store: std::sync::Arc<dyn Store>,
    persistence_tx: Mutex<mpsc::UnboundedSender<PersistenceItem>>,
    price_ring_capacity: usize,
}

pub fn hash_api_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

impl Engine {
    pub fn new(
        store: std::sync::Arc<dyn Store>,
        persistence_tx: mpsc::UnboundedSender<PersistenceItem>,
        price_ring_capacity: usize,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState::empty()),
            store,
            persistence_tx: Mutex::new(persistence_tx),
            price_ring_capacity,
        }
    }

    pub fn store(&self) -> &std::sync::Arc<dyn Store> {
        &self.store
    }

    pub fn price_ring_capacity(&self) -> usize {
        self.price_ring_capacity
    }

    /// Swap in a fresh channel after a debug reset recycles the flush loop.
    pub fn set_persistence_sender(&self, tx: mpsc::UnboundedSender<PersistenceItem>) {
        *self.persistence_tx.lock().unwrap() = tx;
    }

    fn send(&self, item: PersistenceItem) {
        // The receiver only disconnects during shutdown, after which new
        // writes are meaningless anyway; dropping them here is correct.
        let _ = self.persistence_tx.lock().unwrap().send(item);
    }

    /// Load brokers, open orders, their trades and recent trade prices into
    /// memory. Called once at startup before the HTTP listener binds.
    ///
    /// `recent_prices` seeds the rings independently of `trades` — it
    /// covers every symbol that has ever traded, not just the trades that
    /// touch an order still open after restart.
    pub fn restore(
        &self,
        brokers: Vec<Broker>,
        orders: Vec<Order>,
        trades: Vec<Trade>,
        recent_prices: HashMap<String, Vec<i64>>,
    ) {
        let mut state = self.state.lock().unwrap();
        for broker in brokers {
            state
                .brokers_by_key_hash
                .insert(broker.api_key_hash.clone(), broker.id);
            state.brokers.insert(broker.id, broker);
        }
        for order in orders {
            if order.status == OrderStatus::Open {
                let _ = state.book.insert(&order);
            }
            state.orders.insert(order.id, order);
        }
        for trade in trades {
            state
                .trades_by_order
                .entry(trade.buy_order_id)
                .or_default()
                .push(trade.clone());
            state
                .trades_by_order
                .entry(trade.sell_order_id)
                .or_default()
                .push(trade.clone());
        }
        for (symbol, prices) in recent_prices {
            let ring = state.price_rings.entry(symbol).or_default();
            for price in prices {
                ring.push_back(price);
                if ring.len() > self.price_ring_capacity {
                    ring.pop_front();
                }
            }
        }
    }

    /// Register a broker: persist synchronously (there's no matching to
    /// race, and the caller needs the write durable before the raw key is
    /// handed back — it's never recoverable after this call returns), then
    /// populate the in-memory lookup maps.
    pub async fn register_broker(
        &self,
        name: String,
        webhook_url: Option<String>,
    ) -> Result<(Broker, String), ExchangeError> {
        let raw_key = format!("key-{}", Uuid::new_v4());
        let api_key_hash = hash_api_key(&raw_key);
        let broker = Broker {
            id: Uuid::new_v4(),
            name,
            api_key_hash: api_key_hash.clone(),
            webhook_url,
            balance: 0,
        };

        self.store.insert_broker(&broker).await?;

        let mut state = self.state.lock().unwrap();
        state
            .brokers_by_key_hash
            .insert(api_key_hash, broker.id);
        state.brokers.insert(broker.id, broker.clone());
        drop(state);

        Ok((broker, raw_key))
    }

    pub fn broker_id_for_key(&self, raw_key: &str) -> Option<BrokerId> {
        let hash = hash_api_key(raw_key);
        self.state.lock().unwrap().brokers_by_key_hash.get(&hash).copied()
    }

    /// `(name, balance)` for the balance read handler.
    pub fn broker_snapshot(&self, broker_id: BrokerId) -> Option<(String, i64)> {
        self.state
            .lock()
            .unwrap()
            .brokers
            .get(&broker_id)
            .map(|b| (b.name.clone(), b.balance))
    }

    /// Validate, insert, match and queue persistence items for one new
    /// order. Everything here runs inside a single critical section.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_order(
        &self,
        broker_id: BrokerId,
        document_number: String,
        symbol: String,
        side: Side,
        order_type: OrderType,
        price: Option<i64>,
        quantity: i64,
        valid_until: DateTime<Utc>,
    ) -> Result<SubmitOutcome, ExchangeError> {
        if quantity <= 0 {
            return Err(ExchangeError::Validation("quantity must be positive".into()));
        }
        match order_type {
            OrderType::Limit if price.is_none() => {
                return Err(ExchangeError::Validation(
                    "limit orders require a price".into(),
                ));
            }
            OrderType::Market if price.is_some() => {
                return Err(ExchangeError::Validation(
                    "market orders must not specify a price".into(),
                ));
            }
            _ => {}
        }
        if let Some(p) = price {
            if p <= 0 {
                return Err(ExchangeError::Validation("price must be positive".into()));
            }
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            broker_id,
            symbol,
            side,
            order_type,
            price,
            quantity,
            remaining_quantity: quantity,
            status: OrderStatus::Open,
            document_number,
            valid_until,
            created_at: now,
        };

        let mut state = self.state.lock().unwrap();
        if !state.brokers.contains_key(&broker_id) {
            return Err(ExchangeError::NotFound(format!("broker {broker_id}")));
        }

        self.send(PersistenceItem::NewOrder(order.clone()));

        state.orders.insert(order.id, order.clone());
        let mut working = order;
        let (fills, expired_ids) =
            matching::match_order(&mut working, &mut state.book, &mut state.orders, now)?;
        state.orders.insert(working.id, working.clone());

        let mut touched: Vec<OrderId> = vec![working.id];
        let mut trades = Vec::with_capacity(fills.len());
        for fill in &fills {
            let trade = &fill.trade;
            state
                .trades_by_order
                .entry(trade.buy_order_id)
                .or_default()
                .push(trade.clone());
            state
                .trades_by_order
                .entry(trade.sell_order_id)
                .or_default()
                .push(trade.clone());
            let ring = state.price_rings.entry(trade.symbol.clone()).or_default();
            ring.push_back(trade.price);
            if ring.len() > self.price_ring_capacity {
                ring.pop_front();
            }
            self.send(PersistenceItem::Trade {
                trade: trade.clone(),
                buyer_remaining: fill.buyer_remaining,
                seller_remaining: fill.seller_remaining,
            });
            if trade.buy_order_id != working.id {
                touched.push(trade.buy_order_id);
            }
            if trade.sell_order_id != working.id {
                touched.push(trade.sell_order_id);
            }

            let (buyer_broker, seller_broker) = (trade.buyer_broker_id, trade.seller_broker_id);
            let delta = trade.price * trade.quantity;
            if let Some(b) = state.brokers.get_mut(&seller_broker) {
                b.balance += delta;
            }
            if let Some(b) = state.brokers.get_mut(&buyer_broker) {
                b.balance -= delta;
            }
            trades.push(trade.clone());
        }
        touched.extend(expired_ids.iter().copied());

        for id in touched {
            if let Some(o) = state.orders.get(&id) {
                self.send(PersistenceItem::OrderUpdate {
                    order_id: o.id,
                    status: o.status,
                    remaining_quantity: o.remaining_quantity,
                });
            }
        }

        Ok(SubmitOutcome { order: working, trades })
    }

    /// Cancel a resting order. A silent no-op (not an error) when the order
    /// is no longer in memory or already closed, matching the write-behind
    /// rule that the durable store may simply not have caught up yet.
    pub fn cancel_order(&self, broker_id: BrokerId, order_id: OrderId) -> Result<bool, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let Some(order) = state.orders.get(&order_id) else {
            return Ok(false);
        };
        if order.broker_id != broker_id {
            return Err(ExchangeError::Forbidden("order belongs to another broker".into()));
        }
        if order.status != OrderStatus::Open {
            return Ok(false);
        }

        let mut order = order.clone();
        state.book.remove(&order);
        order.status = OrderStatus::Closed;
        state.orders.insert(order_id, order.clone());

        self.send(PersistenceItem::OrderUpdate {
            order_id,
            status: OrderStatus::Closed,
            remaining_quantity: order.remaining_quantity,
        });

        // Stays resident until the flush loop confirms the close is durable
        // (see `evict_closed`) — matches the no-read-modify-write-race
        // guarantee the persistence pipeline depends on.
        Ok(true)
    }

    /// Fetch an order plus its trades, checking ownership. Reads memory
    /// first; lazily expires it if past `valid_until`; falls back to the
    /// durable store only when the order isn't resident.
    pub async fn get_order(
        &self,
        broker_id: BrokerId,
        order_id: OrderId,
    ) -> Result<OrderWithTrades, ExchangeError> {
        let now = Utc::now();
        let from_memory = {
            let mut state = self.state.lock().unwrap();
            match state.orders.get(&order_id) {
                Some(order) if order.broker_id != broker_id => {
                    return Err(ExchangeError::Forbidden("order belongs to another broker".into()));
                }
                Some(order) if order.status == OrderStatus::Open && order.is_expired(now) => {
                    let mut order = order.clone();
                    state.book.remove(&order);
                    order.status = OrderStatus::Closed;
                    state.orders.insert(order_id, order.clone());
                    self.send(PersistenceItem::OrderUpdate {
                        order_id,
                        status: OrderStatus::Closed,
                        remaining_quantity: order.remaining_quantity,
                    });
                    let trades = state.trades_by_order.get(&order_id).cloned().unwrap_or_default();
                    Some(OrderWithTrades { order, trades })
                }
                Some(order) => {
                    let trades = state.trades_by_order.get(&order_id).cloned().unwrap_or_default();
                    Some(OrderWithTrades { order: order.clone(), trades })
                }
                None => None,
            }
        };

        if let Some(result) = from_memory {
            return Ok(result);
        }

        let order = self
            .store
            .load_order(order_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound(format!("order {order_id}")))?;
        if order.broker_id != broker_id {
            return Err(ExchangeError::Forbidden("order belongs to another broker".into()));
        }
        let trades = self.store.load_trades_for_order(order_id).await?;
        Ok(OrderWithTrades { order, trades })
    }

    /// Average of the last `count` trade prices for `symbol`, floored.
    /// Returns `(average, trades_used)` — `trades_used` is the number of
    /// prices actually averaged, which is `count` clamped to the ring's
    /// length, not `count` itself.
    pub fn stock_price(&self, symbol: &str, count: usize) -> Option<(i64, usize)> {
        let state = self.state.lock().unwrap();
        let ring = state.price_rings.get(symbol)?;
        if ring.is_empty() {
            return None;
        }
        let take = count.min(ring.len());
        let sum: i64 = ring.iter().rev().take(take).sum();
        Some((sum / take as i64, take))
    }

    pub fn book_depth(&self, symbol: &str, depth: usize) -> (Vec<LevelSummary>, Vec<LevelSummary>) {
        let state = self.state.lock().unwrap();
        let remaining = |id: OrderId| state.orders.get(&id).map(|o| o.remaining_quantity).unwrap_or(0);
        let bids = state.book.depth_levels(symbol, Side::Bid, depth, remaining);
        let asks = state.book.depth_levels(symbol, Side::Ask, depth, remaining);
        (bids, asks)
    }

    /// Wipe all in-memory state. The debug reset endpoint also truncates the
    /// durable store; this only handles the in-memory half.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        *state = EngineState::empty();
    }

    /// Drop closed orders out of the central map once the flush loop has
    /// confirmed they're durable. Safe to call with ids that are already
    /// gone or still open — both are no-ops.
    pub fn evict_closed(&self, order_ids: &[OrderId]) {
        let mut state = self.state.lock().unwrap();
        for id in order_ids {
            if matches!(state.orders.get(id), Some(o) if o.status == OrderStatus::Closed) {
                state.orders.remove(id);
            }
        }
    }

    /// Snapshot of every broker with a configured webhook URL, for the
    /// flush loop to fan out against without holding the lock itself.
    pub fn broker_webhook_urls(&self) -> HashMap<BrokerId, String> {
        self.state
            .lock()
            .unwrap()
            .brokers
            .values()
            .filter_map(|b| b.webhook_url.clone().map(|url| (b.id, url)))
            .collect()
    }
}
