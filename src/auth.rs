//! Bearer-token auth extractors. Admin access is a single shared secret
//! compared in constant time; broker access is resolved through a
//! SHA-256 key-hash lookup against the in-memory broker table.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::AppState;
use crate::errors::ExchangeError;
use crate::model::BrokerId;

fn bearer_token(parts: &Parts) -> Result<&str, ExchangeError> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ExchangeError::Auth)
}

/// Bytewise compare that always walks the full length of `b`, so a
/// mismatched admin key can't be distinguished by how quickly it fails.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Proof the caller presented the configured admin key. Extracting this
/// type is the entire authorization check for admin-only routes.
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ExchangeError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let configured = state.admin_api_key.as_deref().ok_or(ExchangeError::Auth)?;
        let presented = bearer_token(parts)?;
        if constant_time_eq(presented.as_bytes(), configured.as_bytes()) {
            Ok(AdminAuth)
        } else {
            Err(ExchangeError::Auth)
        }
    }
}

/// The broker identified by the bearer token, resolved through the
/// key-hash lookup. Every broker-facing route extracts this instead of
/// reading the header itself.
pub struct BrokerAuth(pub BrokerId);

impl FromRequestParts<AppState> for BrokerAuth {
    type Rejection = ExchangeError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let presented = bearer_token(parts)?;
        state
            .engine
            .broker_id_for_key(presented)
            .map(BrokerAuth)
            .ok_or(ExchangeError::Auth)
    }
}
