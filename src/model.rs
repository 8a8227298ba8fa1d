//! Domain types shared by the order book, the matching engine, the
//! persistence pipeline and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type OrderId = Uuid;
pub type BrokerId = Uuid;
pub type TradeId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
}

/// A resting or matched order, held by value in the engine's central map.
///
/// The book and the trades-by-order index never own an `Order` — they hold
/// [`OrderId`]s and look the value up here. That keeps eviction a single
/// removal from this map instead of a multi-structure teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub broker_id: BrokerId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<i64>,
    pub quantity: i64,
    pub remaining_quantity: i64,
    pub status: OrderStatus,
    pub document_number: String,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub symbol: String,
    pub price: i64,
    pub quantity: i64,
    pub buyer_broker_id: BrokerId,
    pub seller_broker_id: BrokerId,
    pub created_at: DateTime<Utc>,
}

/// In-memory broker record. `balance` is the only field the engine mutates
/// after registration, and only via trade settlement.
#[derive(Debug, Clone)]
pub struct Broker {
    pub id: BrokerId,
    pub name: String,
    pub api_key_hash: String,
    pub webhook_url: Option<String>,
    pub balance: i64,
}
