//! Order-placement capability for the venue's signed REST API.
//!
//! The rest of the crate consumes the `OrderApi` trait only; this module
//! provides the production client (HMAC-signed REST transport with
//! half-up integer quantization and a serialized monotonic client-order
//! counter) plus a dry-run path that skips the wire entirely.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

// ─────────────────────────────────────────────────────────
// Shared order vocabulary
// ─────────────────────────────────────────────────────────

/// Quoting side. `Ask` means sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    PostOnly,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub market: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub client_order_id: u64,
    pub tx_hash: Option<String>,
}

/// Capability interface consumed by the maker engine and the hedger.
#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn create_limit_order(
        &self,
        market: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        reduce_only: bool,
        post_only: bool,
        time_in_force: TimeInForce,
    ) -> Result<PlacedOrder>;

    async fn create_post_only_limit(
        &self,
        market: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        reduce_only: bool,
    ) -> Result<PlacedOrder> {
        self.create_limit_order(market, side, price, size, reduce_only, true, TimeInForce::PostOnly)
            .await
    }

    async fn cancel_order(&self, market: &str, client_order_id: u64) -> Result<()>;
}

// ─────────────────────────────────────────────────────────
// Market handle helpers
// ─────────────────────────────────────────────────────────

/// Numeric index from the canonical `market:<n>` handle. The integer is
/// needed only at the exchange boundary.
pub fn parse_market_index(market: &str) -> Result<u32> {
    let Some((prefix, suffix)) = market.split_once(':') else {
        bail!("unexpected market format: {market}");
    };
    if prefix != "market" {
        bail!("unsupported market prefix: {market}");
    }
    suffix
        .parse::<u32>()
        .with_context(|| format!("invalid market index: {market}"))
}

// ─────────────────────────────────────────────────────────
// REST client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrderClientConfig {
    pub base_url: String,
    pub account_index: i64,
    pub api_key_index: u32,
    pub size_scale: u64,
    pub price_scale: u64,
    /// Per-request deadline for the REST transport.
    pub request_timeout_ms: u64,
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
struct OrderRequest {
    market_index: u32,
    client_order_index: u64,
    base_amount: u64,
    price: u64,
    is_ask: bool,
    order_type: &'static str,
    time_in_force: TimeInForce,
    reduce_only: bool,
    post_only: bool,
}

#[derive(Debug, Serialize)]
struct CancelRequest {
    market_index: u32,
    order_index: u64,
}

#[derive(Debug, Default, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

pub struct RestOrderClient {
    cfg: OrderClientConfig,
    http: reqwest::Client,
    key: Option<SecretString>,
    /// One monotonic counter feeds both client-order-ids and signer
    /// nonces; concurrent place/cancel serialize here.
    next_index: Mutex<u64>,
}

impl RestOrderClient {
    pub fn new(cfg: OrderClientConfig, private_key: Option<String>) -> Self {
        let timeout_ms = if cfg.request_timeout_ms > 0 { cfg.request_timeout_ms } else { 10_000 };
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1);
        if private_key.is_none() && !cfg.dry_run {
            warn!("no signing key configured; order routing forced to dry-run");
        }
        Self {
            cfg,
            http,
            key: private_key.map(SecretString::from),
            next_index: Mutex::new(seed),
        }
    }

    fn is_dry_run(&self) -> bool {
        self.cfg.dry_run || self.key.is_none()
    }

    async fn next_order_index(&self) -> u64 {
        let mut guard = self.next_index.lock().await;
        *guard += 1;
        *guard
    }

    /// Multiply into exchange integer units, rounding half-up. The result
    /// must be a positive integer or the order is rejected client-side.
    fn scale_value(&self, raw: Decimal, scale: u64, label: &str) -> Result<u64> {
        if scale == 0 {
            bail!("{label} scale must be positive");
        }
        let scaled = (raw * Decimal::from(scale))
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        match scaled.to_u64() {
            Some(v) if v > 0 => Ok(v),
            _ => bail!("{label} {raw} scales to non-positive integer ({scaled})"),
        }
    }

    fn sign(&self, nonce: u64, path: &str, body: &str) -> Result<String> {
        let key = self
            .key
            .as_ref()
            .context("signing key missing")?;
        let canonical = format!(
            "{}:{}:{}:{}:{}",
            self.cfg.account_index, self.cfg.api_key_index, nonce, path, body
        );
        let mut mac = HmacSha256::new_from_slice(key.expose_secret().as_bytes())
            .context("invalid signing key")?;
        mac.update(canonical.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn post_signed(&self, path: &str, nonce: u64, body: String) -> Result<OrderResponse> {
        let signature = self.sign(nonce, path, &body)?;
        let url = format!("{}{path}", self.cfg.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Account-Index", self.cfg.account_index)
            .header("X-Api-Key-Index", self.cfg.api_key_index)
            .header("X-Nonce", nonce)
            .header("X-Signature", signature)
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        let parsed: OrderResponse = resp.json().await.unwrap_or_default();
        if !status.is_success() {
            bail!(
                "exchange rejected request ({status}): {}",
                parsed.message.unwrap_or_default()
            );
        }
        if let Some(code) = parsed.code {
            if code != 0 {
                bail!(
                    "exchange error code {code}: {}",
                    parsed.message.unwrap_or_default()
                );
            }
        }
        Ok(parsed)
    }
}

#[async_trait]
impl OrderApi for RestOrderClient {
    async fn create_limit_order(
        &self,
        market: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        reduce_only: bool,
        post_only: bool,
        time_in_force: TimeInForce,
    ) -> Result<PlacedOrder> {
        let market_index = parse_market_index(market)?;
        let base_amount = self.scale_value(size, self.cfg.size_scale, "size")?;
        let price_units = self.scale_value(price, self.cfg.price_scale, "price")?;
        let client_order_index = self.next_order_index().await;

        if self.is_dry_run() {
            info!(
                "[dry-run] {} {} {}@{} (tif={:?} reduce_only={})",
                market,
                side.as_str(),
                size,
                price,
                time_in_force,
                reduce_only,
            );
            return Ok(PlacedOrder {
                market: market.to_string(),
                side,
                price,
                size,
                client_order_id: client_order_index,
                tx_hash: None,
            });
        }

        let request = OrderRequest {
            market_index,
            client_order_index,
            base_amount,
            price: price_units,
            is_ask: side == Side::Ask,
            order_type: "limit",
            time_in_force,
            reduce_only,
            post_only,
        };
        let body = serde_json::to_string(&request)?;
        info!(
            "submitting {} order market={} id={} base_units={} price_units={}",
            side.as_str(),
            market,
            client_order_index,
            base_amount,
            price_units,
        );
        let resp = self.post_signed("/api/v1/order", client_order_index, body).await?;
        Ok(PlacedOrder {
            market: market.to_string(),
            side,
            price,
            size,
            client_order_id: client_order_index,
            tx_hash: resp.tx_hash,
        })
    }

    async fn cancel_order(&self, market: &str, client_order_id: u64) -> Result<()> {
        let market_index = parse_market_index(market)?;
        if self.is_dry_run() {
            info!("[dry-run] cancel market={} id={}", market, client_order_id);
            return Ok(());
        }
        let nonce = self.next_order_index().await;
        let body = serde_json::to_string(&CancelRequest { market_index, order_index: client_order_id })?;
        info!("cancelling order market={} id={}", market, client_order_id);
        self.post_signed("/api/v1/order/cancel", nonce, body).await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// WS auth token helper
// ─────────────────────────────────────────────────────────

/// Short-lived token for authenticated WS channels:
/// `base64(account:expiry) . base64(hmac_sha256(key, account:expiry))`.
pub fn ws_auth_token(account_index: i64, private_key: &str, ttl_seconds: u64) -> Result<String> {
    let expiry = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        + ttl_seconds;
    let payload = format!("{account_index}:{expiry}");
    let mut mac = HmacSha256::new_from_slice(private_key.as_bytes())
        .context("invalid ws auth key")?;
    mac.update(payload.as_bytes());
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    Ok(format!(
        "{}.{}",
        engine.encode(payload.as_bytes()),
        engine.encode(mac.finalize().into_bytes())
    ))
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
