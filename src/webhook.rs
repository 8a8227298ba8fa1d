//! Best-effort webhook fan-out. Fired after a flush commits, never awaited
//! by the caller, failures only ever logged.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{OrderId, Side, TradeId};

/// Tagged so new event kinds are additive — one variant today, more later
/// without breaking existing subscribers' deserializers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookPayload {
    TradeExecuted {
        trade_id: TradeId,
        order_id: OrderId,
        symbol: String,
        side: Side,
        price: i64,
        quantity: i64,
        order_remaining_quantity: i64,
        executed_at: DateTime<Utc>,
    },
}

/// Deliver `payload` to `url`, fire-and-forget. Spawns its own task so a
/// slow or unreachable subscriber never holds up the flush loop.
pub fn deliver(client: reqwest::Client, url: String, payload: WebhookPayload, timeout: Duration) {
    tokio::spawn(async move {
        let request_id = Uuid::new_v4();
        let result = client
            .post(&url)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(%request_id, url, "webhook delivered");
            }
            Ok(resp) => {
                tracing::warn!(%request_id, url, status = %resp.status(), "webhook rejected");
            }
            Err(err) => {
                tracing::warn!(%request_id, url, error = %err, "webhook delivery failed");
            }
        }
    });
}
