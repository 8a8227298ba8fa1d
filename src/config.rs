//! Environment-driven settings, loaded once in `main` and handed around as
//! a plain struct — no global singleton.

use std::time::Duration;

/// Prefix every environment variable this process reads. Keeps `.env`
/// collisions with unrelated tooling unlikely.
const ENV_PREFIX: &str = "EXCHANGE_";

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub admin_api_key: Option<String>,
    pub flush_interval: Duration,
    pub price_ring_capacity: usize,
    pub webhook_timeout: Duration,
}

impl Settings {
    /// Reads `.env` if present, then the real environment (which always
    /// wins over `.env`), and applies defaults for anything optional.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let bind_addr = env_var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let database_url = env_var("DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("{ENV_PREFIX}DATABASE_URL must be set"))?;
        let admin_api_key = env_var("ADMIN_API_KEY");
        let flush_interval_ms: u64 = env_var("FLUSH_INTERVAL_MS")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(30);
        let price_ring_capacity: usize = env_var("PRICE_RING_CAPACITY")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(1000);
        let webhook_timeout_secs: u64 = env_var("WEBHOOK_TIMEOUT_SECS")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(5);

        Ok(Self {
            bind_addr,
            database_url,
            admin_api_key,
            flush_interval: Duration::from_millis(flush_interval_ms),
            price_ring_capacity,
            webhook_timeout: Duration::from_secs(webhook_timeout_secs),
        })
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}
