//! Per-symbol, price-indexed FIFO order book.
//!
//! Each symbol gets its own `BTreeMap<price, VecDeque<OrderId>>` per side.
//! The book only ever stores [`OrderId`]s — never [`Order`] values — so the
//! engine's central orders map stays the single owner and eviction never has
//! to chase references through more than one structure.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::errors::ExchangeError;
use crate::model::{Order, OrderId, OrderStatus, Side};

type PriceLevels = BTreeMap<i64, VecDeque<OrderId>>;

#[derive(Debug, Default)]
pub struct OrderBook {
    bids: HashMap<String, PriceLevels>,
    asks: HashMap<String, PriceLevels>,
}

/// One price level as reported to a book-depth reader.
#[derive(Debug, Clone, Copy)]
pub struct LevelSummary {
    pub price: i64,
    pub total_quantity: i64,
    pub order_count: usize,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn side_map(&mut self, side: Side) -> &mut HashMap<String, PriceLevels> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn side_map_ref(&self, side: Side) -> &HashMap<String, PriceLevels> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// Append `order` to the tail of its (symbol, side, price) queue.
    pub fn insert(&mut self, order: &Order) -> Result<(), ExchangeError> {
        if order.status != OrderStatus::Open {
            return Err(ExchangeError::InvariantViolation(
                "attempted to insert a closed order into the book".into(),
            ));
        }
        let price = order.price.ok_or_else(|| {
            ExchangeError::InvariantViolation("attempted to rest a priceless order".into())
        })?;
        self.side_map(order.side)
            .entry(order.symbol.clone())
            .or_default()
            .entry(price)
            .or_default()
            .push_back(order.id);
        Ok(())
    }

    /// Lowest ask / highest bid for `symbol`, plus the id of the order at
    /// the front of that level's queue. `None` once the level is empty —
    /// never an empty queue.
    pub fn best(&self, symbol: &str, side: Side) -> Option<(i64, OrderId)> {
        let levels = self.side_map_ref(side).get(symbol)?;
        let (&price, front) = match side {
            Side::Ask => levels.iter().next()?,
            Side::Bid => levels.iter().next_back()?,
        };
        Some((price, *front.front()?))
    }

    /// Pop the head order off a specific (symbol, side, price) level,
    /// deleting the level if it becomes empty.
    pub fn pop_front(&mut self, symbol: &str, side: Side, price: i64) -> Option<OrderId> {
        let levels = self.side_map(side).get_mut(symbol)?;
        let queue = levels.get_mut(&price)?;
        let popped = queue.pop_front();
        if queue.is_empty() {
            levels.remove(&price);
        }
        popped
    }

    /// Excise a specific resting order (cancel, lazy expiration).
    pub fn remove(&mut self, order: &Order) {
        let Some(price) = order.price else { return };
        let Some(levels) = self.side_map(order.side).get_mut(&order.symbol) else {
            return;
        };
        let Some(queue) = levels.get_mut(&price) else {
            return;
        };
        if let Some(pos) = queue.iter().position(|id| *id == order.id) {
            queue.remove(pos);
        }
        if queue.is_empty() {
            levels.remove(&price);
        }
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Walk up to `depth` price levels in best-first order for reads.
    /// Asks ascend from the lowest price; bids descend from the highest.
    pub fn depth_levels<F>(
        &self,
        symbol: &str,
        side: Side,
        depth: usize,
        mut remaining_quantity: F,
    ) -> Vec<LevelSummary>
    where
        F: FnMut(OrderId) -> i64,
    {
        let Some(levels) = self.side_map_ref(side).get(symbol) else {
            return Vec::new();
        };
        let iter: Box<dyn Iterator<Item = (&i64, &VecDeque<OrderId>)>> = match side {
            Side::Ask => Box::new(levels.iter()),
            Side::Bid => Box::new(levels.iter().rev()),
        };
        iter.take(depth)
            .map(|(&price, queue)| LevelSummary {
                price,
                total_quantity: queue.iter().map(|id| remaining_quantity(*id)).sum(),
                order_count: queue.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderType;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample(side: Side, price: i64, qty: i64) -> Order {
        Order {
            id: Uuid::new_v4(),
            broker_id: Uuid::new_v4(),
            symbol: "SYM".into(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            quantity: qty,
            remaining_quantity: qty,
            status: OrderStatus::Open,
            document_number: "doc".into(),
            valid_until: Utc::now() + chrono::Duration::hours(1),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn best_returns_none_once_last_order_at_level_is_popped() {
        let mut book = OrderBook::new();
        let order = sample(Side::Ask, 100, 5);
        book.insert(&order).unwrap();
        assert_eq!(book.best("SYM", Side::Ask), Some((100, order.id)));

        book.pop_front("SYM", Side::Ask, 100);
        assert_eq!(book.best("SYM", Side::Ask), None);
    }

    #[test]
    fn fifo_within_price_level() {
        let mut book = OrderBook::new();
        let first = sample(Side::Ask, 100, 5);
        let second = sample(Side::Ask, 100, 5);
        book.insert(&first).unwrap();
        book.insert(&second).unwrap();

        let (_, front) = book.best("SYM", Side::Ask).unwrap();
        assert_eq!(front, first.id);
        book.pop_front("SYM", Side::Ask, 100);
        let (_, front) = book.best("SYM", Side::Ask).unwrap();
        assert_eq!(front, second.id);
    }

    #[test]
    fn insert_rejects_closed_order() {
        let mut book = OrderBook::new();
        let mut order = sample(Side::Bid, 100, 5);
        order.status = OrderStatus::Closed;
        assert!(book.insert(&order).is_err());
    }

    #[test]
    fn remove_prunes_empty_level() {
        let mut book = OrderBook::new();
        let order = sample(Side::Bid, 50, 5);
        book.insert(&order).unwrap();
        book.remove(&order);
        assert_eq!(book.best("SYM", Side::Bid), None);
    }

    #[test]
    fn depth_levels_orders_bids_descending_and_asks_ascending() {
        let mut book = OrderBook::new();
        for price in [100, 105, 102] {
            book.insert(&sample(Side::Ask, price, 1)).unwrap();
            book.insert(&sample(Side::Bid, price, 1)).unwrap();
        }
        let asks = book.depth_levels("SYM", Side::Ask, 10, |_| 1);
        let prices: Vec<i64> = asks.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![100, 102, 105]);

        let bids = book.depth_levels("SYM", Side::Bid, 10, |_| 1);
        let prices: Vec<i64> = bids.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![105, 102, 100]);
    }
}
