//! Write-behind persistence: the synchronous path only ever pushes items
//! into an unbounded channel. This loop drains it on a fixed cadence,
//! dedups per-order updates, writes one transaction, fires webhooks after
//! it commits, then evicts closed orders from memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::model::{BrokerId, Order, OrderId, OrderStatus, Side, Trade};
use crate::store::{BatchWrite, OrderUpdate, Store};
use crate::webhook::{self, WebhookPayload};

#[derive(Debug, Clone)]
pub enum PersistenceItem {
    NewOrder(Order),
    /// `buyer_remaining`/`seller_remaining` are the remaining quantity of
    /// each side immediately after this fill — not the order's final
    /// remaining for the batch, which a later `OrderUpdate` already carries.
    /// They exist only to give the webhook its `order_remaining_quantity`.
    Trade {
        trade: Trade,
        buyer_remaining: i64,
        seller_remaining: i64,
    },
    OrderUpdate {
        order_id: OrderId,
        status: OrderStatus,
        remaining_quantity: i64,
    },
}

pub fn channel() -> (mpsc::UnboundedSender<PersistenceItem>, mpsc::UnboundedReceiver<PersistenceItem>) {
    mpsc::unbounded_channel()
}

/// Drain `rx` into one `BatchWrite`, deduplicating `OrderUpdate`s by
/// `order_id` (keep the last one seen — it carries the final remaining
/// quantity and status). Trade deltas are folded into per-broker balance
/// deltas here so the store only ever sees the net change.
/// A trade plus the per-side remaining quantity right after it executed,
/// carried through to the webhook fan-out once the batch commits.
struct TradeForWebhook {
    trade: Trade,
    buyer_remaining: i64,
    seller_remaining: i64,
}

fn drain(rx: &mut mpsc::UnboundedReceiver<PersistenceItem>) -> (BatchWrite, Vec<TradeForWebhook>) {
    let mut batch = BatchWrite::default();
    let mut updates: HashMap<OrderId, OrderUpdate> = HashMap::new();
    let mut balance_deltas: HashMap<BrokerId, i64> = HashMap::new();
    let mut trades_for_webhooks = Vec::new();

    while let Ok(item) = rx.try_recv() {
        match item {
            PersistenceItem::NewOrder(order) => batch.new_orders.push(order),
            PersistenceItem::Trade {
                trade,
                buyer_remaining,
                seller_remaining,
            } => {
                let notional = trade.price * trade.quantity;
                *balance_deltas.entry(trade.seller_broker_id).or_insert(0) += notional;
                *balance_deltas.entry(trade.buyer_broker_id).or_insert(0) -= notional;
                trades_for_webhooks.push(TradeForWebhook {
                    trade: trade.clone(),
                    buyer_remaining,
                    seller_remaining,
                });
                batch.trades.push(trade);
            }
            PersistenceItem::OrderUpdate {
                order_id,
                status,
                remaining_quantity,
            } => {
                updates.insert(
                    order_id,
                    OrderUpdate {
                        order_id,
                        status,
                        remaining_quantity,
                    },
                );
            }
        }
    }

    batch.order_updates = updates.into_values().collect();
    batch.balance_deltas = balance_deltas.into_iter().collect();
    (batch, trades_for_webhooks)
}

async fn flush_once(
    engine: &Arc<Engine>,
    store: &Arc<dyn Store>,
    rx: &mut mpsc::UnboundedReceiver<PersistenceItem>,
    webhook_client: &reqwest::Client,
    webhook_timeout: Duration,
) {
    let webhook_urls = engine.broker_webhook_urls();
    let (batch, trades) = drain(rx);
    if batch.is_empty() {
        return;
    }

    let closed_order_ids: Vec<OrderId> = batch
        .order_updates
        .iter()
        .filter(|u| u.status == OrderStatus::Closed)
        .map(|u| u.order_id)
        .collect();

    if let Err(err) = store.apply_batch(batch).await {
        // Items are gone once drained — a failed flush is logged and the
        // next tick continues, same as the matching engine never rolling
        // back a fill. Durability lags the in-memory truth; it never
        // contradicts it.
        tracing::error!(error = %err, "persistence flush failed");
        return;
    }

    for tfw in trades {
        let trade = &tfw.trade;
        for (broker_id, side_order_id, side, order_remaining_quantity) in [
            (trade.seller_broker_id, trade.sell_order_id, Side::Ask, tfw.seller_remaining),
            (trade.buyer_broker_id, trade.buy_order_id, Side::Bid, tfw.buyer_remaining),
        ] {
            let Some(url) = webhook_urls.get(&broker_id).cloned() else {
                continue;
            };
            webhook::deliver(
                webhook_client.clone(),
                url.clone(),
                WebhookPayload::TradeExecuted {
                    trade_id: trade.id,
                    order_id: side_order_id,
                    symbol: trade.symbol.clone(),
                    side,
                    price: trade.price,
                    quantity: trade.quantity,
                    order_remaining_quantity,
                    executed_at: trade.created_at,
                },
                webhook_timeout,
            );
        }
    }

    // Only now, with the write durable, can a closed order leave memory.
    engine.evict_closed(&closed_order_ids);
}

/// Runs until `shutdown` fires, then drains and flushes once more before
/// returning — nothing queued before shutdown is lost.
pub async fn run_flush_loop(
    engine: Arc<Engine>,
    store: Arc<dyn Store>,
    mut rx: mpsc::UnboundedReceiver<PersistenceItem>,
    webhook_client: reqwest::Client,
    webhook_timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush_once(&engine, &store, &mut rx, &webhook_client, webhook_timeout).await;
            }
            _ = shutdown.cancelled() => {
                flush_once(&engine, &store, &mut rx, &webhook_client, webhook_timeout).await;
                tracing::info!("persistence loop drained on shutdown");
                break;
            }
        }
    }
}

/// A running flush loop plus what it takes to stop it. The debug-reset
/// endpoint is the only caller that stops one mid-process; normal shutdown
/// cancels the token passed to `run_flush_loop` directly.
pub struct FlushLoopHandle {
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_flush_loop(
    engine: Arc<Engine>,
    store: Arc<dyn Store>,
    rx: mpsc::UnboundedReceiver<PersistenceItem>,
    webhook_client: reqwest::Client,
    webhook_timeout: Duration,
    interval: Duration,
) -> FlushLoopHandle {
    let shutdown = CancellationToken::new();
    let task_token = shutdown.clone();
    let task = tokio::spawn(run_flush_loop(
        engine,
        store,
        rx,
        webhook_client,
        webhook_timeout,
        interval,
        task_token,
    ));
    FlushLoopHandle { shutdown, task }
}

impl FlushLoopHandle {
    /// Cancel the loop and wait for its final best-effort drain+flush.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "persistence loop task panicked");
        }
    }
}
