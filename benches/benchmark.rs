use std::collections::HashMap;

use chrono::Utc;
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use mini_exchange::matching::match_order;
use mini_exchange::model::{Order, OrderId, OrderStatus, OrderType, Side};
use mini_exchange::orderbook::OrderBook;
use uuid::Uuid;

fn resting_order(side: Side, price: i64, qty: i64) -> Order {
    let now = Utc::now();
    Order {
        id: Uuid::new_v4(),
        broker_id: Uuid::new_v4(),
        symbol: "BTCUSD".into(),
        side,
        order_type: OrderType::Limit,
        price: Some(price),
        quantity: qty,
        remaining_quantity: qty,
        status: OrderStatus::Open,
        document_number: "bench".into(),
        valid_until: now + chrono::Duration::hours(1),
        created_at: now,
    }
}

fn setup_book(depth: i64, orders_per_level: i64) -> (OrderBook, HashMap<OrderId, Order>) {
    let mut book = OrderBook::new();
    let mut orders = HashMap::new();
    for price in 1..=depth {
        for _ in 0..orders_per_level {
            for side in [Side::Ask, Side::Bid] {
                let order = resting_order(side, price, 1);
                book.insert(&order).unwrap();
                orders.insert(order.id, order);
            }
        }
    }
    (book, orders)
}

fn bench_match_order(c: &mut Criterion) {
    let depth = 100;
    let orders_per_level = 10;

    c.bench_function("market order sweeps half the book", |b| {
        b.iter_batched(
            || setup_book(depth, orders_per_level),
            |(mut book, mut orders)| {
                let mut market_buy = resting_order(Side::Bid, 0, depth * orders_per_level / 2);
                market_buy.order_type = OrderType::Market;
                market_buy.price = None;
                match_order(&mut market_buy, &mut book, &mut orders, Utc::now()).unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("limit order crosses the whole book", |b| {
        b.iter_batched(
            || setup_book(depth, orders_per_level),
            |(mut book, mut orders)| {
                let mut limit_sell = resting_order(Side::Ask, depth / 2, depth * orders_per_level);
                match_order(&mut limit_sell, &mut book, &mut orders, Utc::now()).unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("non-crossing limit order just rests", |b| {
        b.iter_batched(
            || setup_book(depth, orders_per_level),
            |(mut book, mut orders)| {
                let mut limit_buy = resting_order(Side::Bid, 1, 1);
                match_order(&mut limit_buy, &mut book, &mut orders, Utc::now()).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_match_order);
criterion_main!(benches);
