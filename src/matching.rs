//! The matching algorithm: a pure function over (incoming order, book,
//! central order map) with zero I/O. It mutates orders in place and returns
//! the trades produced plus any counterparties closed by lazy expiration.
//!
//! Price-time priority, the seller-price rule, and IOC semantics for market
//! orders are all enforced here and nowhere else.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::ExchangeError;
use crate::model::{Order, OrderId, OrderStatus, OrderType, Side, Trade};
use crate::orderbook::OrderBook;

/// A trade plus the point-in-time remaining quantity of each side right
/// after it executed — the matching loop is the only place that knows this
/// per-fill, since a resting order can be touched by several fills in one
/// call and the persistence/webhook layers need the value at each one, not
/// just the final remaining after the whole match.
#[derive(Debug, Clone)]
pub struct Fill {
    pub trade: Trade,
    pub buyer_remaining: i64,
    pub seller_remaining: i64,
}

/// Match `incoming` against the opposite side of `book`, mutating `incoming`
/// and any counterparties found in `orders` in place.
///
/// Returns `(fills, expired_counterparty_ids)`. The caller still owns
/// deciding what to do with `incoming` once this returns — resting it,
/// queuing persistence items, updating balances — this function only runs
/// the algorithm.
pub fn match_order(
    incoming: &mut Order,
    book: &mut OrderBook,
    orders: &mut HashMap<OrderId, Order>,
    now: DateTime<Utc>,
) -> Result<(Vec<Fill>, Vec<OrderId>), ExchangeError> {
    if incoming.status != OrderStatus::Open {
        return Err(ExchangeError::InvariantViolation(
            "matcher invoked with an already-closed incoming order".into(),
        ));
    }

    let mut fills = Vec::new();
    let mut expired = Vec::new();
    let opposite = incoming.side.opposite();
    let is_market = incoming.order_type == OrderType::Market;

    while incoming.remaining_quantity > 0 {
        let Some((best_price, counterparty_id)) = book.best(&incoming.symbol, opposite) else {
            break;
        };

        if !is_market {
            // incoming always has a price for a limit order (validated at submit time).
            let limit_price = incoming.price.expect("limit order without a price");
            let crosses = match incoming.side {
                Side::Bid => best_price <= limit_price,
                Side::Ask => best_price >= limit_price,
            };
            if !crosses {
                break;
            }
        }

        let counterparty_valid_until = orders
            .get(&counterparty_id)
            .map(|c| c.valid_until)
            .unwrap_or(now);

        if counterparty_valid_until < now {
            book.pop_front(&incoming.symbol, opposite, best_price);
            if let Some(c) = orders.get_mut(&counterparty_id) {
                c.status = OrderStatus::Closed;
            }
            expired.push(counterparty_id);
            continue;
        }

        let (counterparty_remaining, counterparty_price, counterparty_broker_id) = {
            let c = orders.get(&counterparty_id).ok_or_else(|| {
                ExchangeError::InvariantViolation(
                    "order resting in the book is missing from the orders map".into(),
                )
            })?;
            (c.remaining_quantity, c.price, c.broker_id)
        };

        let qty = incoming.remaining_quantity.min(counterparty_remaining);
        let trade_price = seller_price_rule(incoming.side, incoming.price, counterparty_price);

        let (buy_order_id, sell_order_id, buyer_broker_id, seller_broker_id) = match incoming.side
        {
            Side::Bid => (
                incoming.id,
                counterparty_id,
                incoming.broker_id,
                counterparty_broker_id,
            ),
            Side::Ask => (
                counterparty_id,
                incoming.id,
                counterparty_broker_id,
                incoming.broker_id,
            ),
        };

        let trade = Trade {
            id: Uuid::new_v4(),
            buy_order_id,
            sell_order_id,
            symbol: incoming.symbol.clone(),
            price: trade_price,
            quantity: qty,
            buyer_broker_id,
            seller_broker_id,
            created_at: now,
        };

        incoming.remaining_quantity -= qty;
        let counterparty_remaining_after = if let Some(c) = orders.get_mut(&counterparty_id) {
            c.remaining_quantity -= qty;
            if c.remaining_quantity == 0 {
                c.status = OrderStatus::Closed;
                book.pop_front(&incoming.symbol, opposite, best_price);
            }
            c.remaining_quantity
        } else {
            0
        };

        let (buyer_remaining, seller_remaining) = match incoming.side {
            Side::Bid => (incoming.remaining_quantity, counterparty_remaining_after),
            Side::Ask => (counterparty_remaining_after, incoming.remaining_quantity),
        };

        fills.push(Fill {
            trade,
            buyer_remaining,
            seller_remaining,
        });
    }

    if incoming.remaining_quantity > 0 {
        if incoming.order_type == OrderType::Market {
            incoming.status = OrderStatus::Closed;
        } else {
            book.insert(incoming)?;
        }
    } else {
        incoming.status = OrderStatus::Closed;
    }

    Ok((fills, expired))
}

/// `trade_price = (incoming.side == ask ? (incoming.price ?? counterparty.price) : counterparty.price)`
fn seller_price_rule(incoming_side: Side, incoming_price: Option<i64>, counterparty_price: Option<i64>) -> i64 {
    match incoming_side {
        Side::Bid => counterparty_price.expect("resting ask must always carry a price"),
        Side::Ask => incoming_price
            .or(counterparty_price)
            .expect("either the incoming ask or the resting bid must carry a price"),
    }
}
