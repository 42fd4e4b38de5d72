//! Private account-channel consumer.
//!
//! Subscribes to `account_all/<account-index>` and is the single source of
//! truth for inventory. Every trade entry is classified maker/taker from
//! our perspective, turned into a signed base delta, and applied in a
//! fixed order: inventory → volume sample → cash flow → FIFO realized →
//! edge/slippage → ledger append → hedger wake. Position snapshot frames
//! overwrite inventory wholesale; tracked markets absent from a snapshot
//! reset to zero.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::{FeesConfig, WsConfig};
use crate::exchange::Side;
use crate::ledger::{FillEvent, FillSource, MetricsLedger, PositionJournal, PositionPnl, Role};
use crate::mm::market_ws::value_to_decimal;
use crate::mm::messages::FillNotice;
use crate::now_ts;
use crate::state::StateStore;
use crate::telemetry::Telemetry;

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────
// FIFO lot book
// ─────────────────────────────────────────────────────────

/// One open lot: signed size (positive = long) at an entry price.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Lot {
    size: Decimal,
    price: Decimal,
}

/// Per-market FIFO lots with a cumulative realized-quote counter.
///
/// Opposite-signed fills match against the oldest lots first; a partially
/// consumed front lot is replaced, never mutated in place. Fees subtract
/// from realized.
#[derive(Debug, Default)]
pub struct FifoBook {
    lots: HashMap<String, VecDeque<Lot>>,
    realized: HashMap<String, Decimal>,
}

impl FifoBook {
    /// Apply one fill; returns this fill's realized delta (fee included).
    pub fn apply(
        &mut self,
        market: &str,
        base_delta: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> Decimal {
        let lots = self.lots.entry(market.to_string()).or_default();
        let mut realized = Decimal::ZERO;

        if base_delta > Decimal::ZERO {
            let mut remaining = base_delta;
            while remaining > Decimal::ZERO {
                let Some(front) = lots.front().copied() else { break };
                if front.size >= Decimal::ZERO {
                    break;
                }
                let matched = remaining.min(-front.size);
                realized += (front.price - price) * matched;
                remaining -= matched;
                lots.pop_front();
                let leftover = front.size + matched;
                if !leftover.is_zero() {
                    lots.push_front(Lot { size: leftover, price: front.price });
                }
            }
            if remaining > Decimal::ZERO {
                lots.push_back(Lot { size: remaining, price });
            }
        } else if base_delta < Decimal::ZERO {
            let mut remaining = -base_delta;
            while remaining > Decimal::ZERO {
                let Some(front) = lots.front().copied() else { break };
                if front.size <= Decimal::ZERO {
                    break;
                }
                let matched = remaining.min(front.size);
                realized += (price - front.price) * matched;
                remaining -= matched;
                lots.pop_front();
                let leftover = front.size - matched;
                if !leftover.is_zero() {
                    lots.push_front(Lot { size: leftover, price: front.price });
                }
            }
            if remaining > Decimal::ZERO {
                lots.push_back(Lot { size: -remaining, price });
            }
        }

        realized -= fee;
        *self.realized.entry(market.to_string()).or_insert(Decimal::ZERO) += realized;
        realized
    }

    pub fn realized(&self, market: &str) -> Decimal {
        self.realized.get(market).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn realized_total(&self) -> Decimal {
        self.realized.values().copied().sum()
    }

    pub fn open_position(&self, market: &str) -> Decimal {
        self.lots
            .get(market)
            .map(|lots| lots.iter().map(|l| l.size).sum())
            .unwrap_or(Decimal::ZERO)
    }
}

// ─────────────────────────────────────────────────────────
// Listener actor
// ─────────────────────────────────────────────────────────

pub struct AccountListener {
    ws: WsConfig,
    account_index: Option<i64>,
    market_filter: Vec<String>,
    default_market: String,
    fees: FeesConfig,
    state: Arc<StateStore>,
    ledger: Arc<MetricsLedger>,
    positions_journal: Arc<PositionJournal>,
    telemetry: Telemetry,
    hedger_tx: mpsc::Sender<FillNotice>,
    shutdown: watch::Receiver<bool>,
    fifo: FifoBook,
}

impl AccountListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ws: WsConfig,
        account_index: Option<i64>,
        maker_pair: &str,
        fees: FeesConfig,
        state: Arc<StateStore>,
        ledger: Arc<MetricsLedger>,
        positions_journal: Arc<PositionJournal>,
        telemetry: Telemetry,
        hedger_tx: mpsc::Sender<FillNotice>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        if let Some(idx) = account_index {
            state.set_account_index(idx);
        }
        let market_filter = if maker_pair.starts_with("market:") {
            vec![maker_pair.to_string()]
        } else {
            Vec::new()
        };
        Self {
            ws,
            account_index,
            market_filter,
            default_market: maker_pair.to_string(),
            fees,
            state,
            ledger,
            positions_journal,
            telemetry,
            hedger_tx,
            shutdown,
            fifo: FifoBook::default(),
        }
    }

    pub async fn run(mut self) {
        let Some(url) = self.ws.url.clone() else {
            warn!("[account] no WS configured; account listener idle");
            return;
        };
        let Some(account) = self.account_index else {
            warn!("[account] no account configured; listener idle");
            return;
        };
        info!("[account] starting account listener for account_all/{account}");

        while !*self.shutdown.borrow() {
            if let Err(err) = self.run_once(&url, account).await {
                warn!("[account] listener error: {err}");
                sleep(RETRY_DELAY).await;
            }
        }
    }

    async fn run_once(&mut self, url: &str, account: i64) -> anyhow::Result<()> {
        let (ws, _resp) = match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => anyhow::bail!("WS connect error: {err}"),
            Err(_) => anyhow::bail!("WS connection timeout"),
        };
        let (mut write, mut read) = ws.split();
        self.subscribe(&mut write, account).await?;

        loop {
            let mut shutdown = self.shutdown.clone();
            let msg = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                msg = timeout(IDLE_TIMEOUT, read.next()) => msg,
            };
            let msg = match msg {
                Ok(m) => m,
                Err(_) => {
                    debug!("[account] idle, waiting");
                    continue;
                }
            };
            match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(obj) = serde_json::from_str::<Value>(&text) else {
                        debug!("[account] invalid JSON frame");
                        continue;
                    };
                    match obj.get("type").and_then(Value::as_str) {
                        Some("ping") => {
                            let pong = json!({"type": "pong"}).to_string();
                            if let Err(err) = write.send(Message::Text(pong)).await {
                                debug!("[account] failed to send pong: {err}");
                            }
                        }
                        Some("connected") => {
                            self.subscribe(&mut write, account).await?;
                        }
                        _ => self.handle_frame(&obj),
                    }
                }
                Some(Ok(Message::Close(_))) => anyhow::bail!("closed by server"),
                Some(Ok(_)) => {}
                Some(Err(err)) => anyhow::bail!("WS error: {err}"),
                None => anyhow::bail!("stream ended"),
            }
        }
    }

    async fn subscribe<S>(&self, write: &mut S, account: i64) -> anyhow::Result<()>
    where
        S: SinkExt<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let mut payload = json!({
            "type": "subscribe",
            "channel": format!("account_all/{account}"),
        });
        if let Some(token) = &self.ws.auth_token {
            payload["auth"] = json!(token);
        }
        write
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|err| anyhow::anyhow!("subscribe failed: {err}"))?;
        info!("[account] subscribed to account_all/{account}");
        Ok(())
    }

    // ───────────────────── frame handling ─────────────────────

    /// Entry point for one decoded account frame. Public for tests.
    pub fn handle_frame(&mut self, obj: &Value) {
        let channel = obj.get("channel").and_then(Value::as_str).unwrap_or("");
        if !channel.starts_with("account_all:") {
            return;
        }

        match obj.get("trades") {
            // map of trade-id → entry (or entry list)
            Some(Value::Object(trades)) => {
                for entry in trades.values() {
                    match entry {
                        Value::Array(subs) => {
                            for sub in subs {
                                self.handle_trade_entry(sub);
                            }
                        }
                        other => self.handle_trade_entry(other),
                    }
                }
            }
            Some(Value::Array(trades)) => {
                for entry in trades {
                    self.handle_trade_entry(entry);
                }
            }
            _ => {}
        }

        if let Some(Value::Object(positions)) = obj.get("positions") {
            let mut seen: Vec<String> = Vec::new();
            for (market_id, entry) in positions {
                self.handle_position_entry(market_id, entry);
                seen.push(market_id.clone());
            }
            // snapshots are authoritative: tracked markets missing from one
            // hold no position on the exchange
            for market in self.tracked_markets() {
                let key = market.split(':').next_back().unwrap_or_default();
                if !seen.iter().any(|s| s == key) {
                    self.state.set_inventory(&market, Decimal::ZERO);
                }
            }
        }
    }

    fn handle_trade_entry(&mut self, entry: &Value) {
        let Some(market_id) = entry.get("market_id") else { return };
        let Some(market) = crate::mm::market_ws::normalize_market(market_id) else {
            return;
        };
        if !self.market_filter.is_empty() && !self.market_filter.contains(&market) {
            return;
        }

        let size = entry
            .get("base_amount")
            .or_else(|| entry.get("size"))
            .and_then(value_to_decimal);
        let price = entry.get("price").and_then(value_to_decimal);
        let (Some(size), Some(price)) = (size, price) else {
            debug!("[account] bad trade entry: {entry}");
            return;
        };
        if size <= Decimal::ZERO || price <= Decimal::ZERO {
            debug!("[account] non-positive trade entry dropped: {entry}");
            return;
        }
        let ts = entry
            .get("timestamp")
            .and_then(Value::as_f64)
            .unwrap_or_else(now_ts);

        let ask_id = int_field(entry, &["ask_account_id", "ask_account"]);
        let bid_id = int_field(entry, &["bid_account_id", "bid_account"]);
        let maker_is_ask = entry
            .get("is_maker_ask")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // whose trade is this, and which side of it are we on
        let (role, base_delta) = match self.classify(ask_id, bid_id, maker_is_ask, size) {
            Some(pair) => pair,
            None => return, // not ours
        };
        let side = if base_delta > Decimal::ZERO { Side::Bid } else { Side::Ask };

        info!(
            "[account] fill {} {} size={} price={}",
            role.as_str(),
            side.as_str(),
            size,
            price
        );

        let notional = size * price;
        let (fee_actual, fee_premium) = match role {
            Role::Maker => (
                notional * self.fees.maker_actual_rate,
                notional * self.fees.maker_premium_rate,
            ),
            Role::Taker => (
                notional * self.fees.taker_actual_rate,
                notional * self.fees.taker_premium_rate,
            ),
        };
        let quote_delta = -(base_delta * price);

        // mutation order is part of the contract
        self.state.update_inventory(&market, base_delta);
        self.state
            .record_volume_sample(role, notional, fee_actual, fee_premium);
        self.state.record_cash_flow(quote_delta, fee_actual);

        if role == Role::Maker {
            self.fifo.apply(&market, base_delta, price, fee_actual);
            let cumulative = self.fifo.realized(&market);
            self.state.set_fifo_realized(&market, cumulative);
            self.telemetry.set_gauge(
                "maker_fifo_realized_quote",
                self.fifo.realized_total().to_f64().unwrap_or(0.0),
            );
            self.telemetry.set_gauge(
                &format!("maker_fifo_realized_quote_{}", market.replace(':', "_")),
                cumulative.to_f64().unwrap_or(0.0),
            );
        }

        let mid = self.state.get_mid(&market);
        if let Some(mid) = mid {
            match role {
                Role::Maker => {
                    let edge = if maker_is_ask {
                        (price - mid) * size
                    } else {
                        (mid - price) * size
                    };
                    if edge > Decimal::ZERO {
                        self.state.record_maker_edge(edge);
                    }
                }
                Role::Taker => {
                    let taker_side = match self.account_index {
                        Some(acct) if Some(acct) == bid_id => Some(Side::Bid),
                        Some(acct) if Some(acct) == ask_id => Some(Side::Ask),
                        _ => None,
                    };
                    if let Some(taker_side) = taker_side {
                        let slip = match taker_side {
                            Side::Ask => (mid - price) * size,
                            Side::Bid => (price - mid) * size,
                        };
                        self.state.record_taker_slippage(slip.abs());
                    }
                }
            }
        }

        self.ledger.append(&FillEvent {
            timestamp: ts,
            market: market.clone(),
            role,
            side,
            size,
            price,
            notional,
            base_delta,
            quote_delta,
            fee_paid: fee_actual,
            mid_price: mid,
            trade_id: entry.get("trade_id").and_then(Value::as_i64),
            source: FillSource::AccountListener,
            ..FillEvent::default()
        });

        self.telemetry.touch("fill");

        // fire-and-forget; the hedger re-reads state on wake
        let _ = self.hedger_tx.try_send(FillNotice {
            market,
            side,
            base_delta,
            price,
            timestamp: ts,
        });
    }

    /// Role plus signed base delta, or None when the trade is not ours.
    fn classify(
        &self,
        ask_id: Option<i64>,
        bid_id: Option<i64>,
        maker_is_ask: bool,
        size: Decimal,
    ) -> Option<(Role, Decimal)> {
        match self.account_index.or_else(|| self.state.get_account_index()) {
            Some(acct) => {
                let maker_id = if maker_is_ask { ask_id } else { bid_id };
                let taker_id = if maker_is_ask { bid_id } else { ask_id };
                let role = if Some(acct) == maker_id {
                    Role::Maker
                } else if Some(acct) == taker_id {
                    Role::Taker
                } else {
                    return None;
                };
                let base_delta = if Some(acct) == ask_id {
                    -size
                } else if Some(acct) == bid_id {
                    size
                } else {
                    // account matched neither leg id; fall back to role + maker side
                    fallback_delta(role, maker_is_ask, size)
                };
                Some((role, base_delta))
            }
            // identity unknown: assume the maker leg is ours
            None => Some((Role::Maker, fallback_delta(Role::Maker, maker_is_ask, size))),
        }
    }

    fn handle_position_entry(&mut self, market_id: &str, entry: &Value) {
        let market = if market_id.starts_with("market:") {
            market_id.to_string()
        } else {
            format!("market:{market_id}")
        };
        if !self.market_filter.is_empty() && !self.market_filter.contains(&market) {
            return;
        }
        let Some(position) = entry.get("position") else {
            self.state.set_inventory(&market, Decimal::ZERO);
            return;
        };
        let Some(mut value) = value_to_decimal(position) else {
            debug!("[account] bad position entry: {entry}");
            return;
        };
        // some venues send magnitude plus a sign indicator
        match entry.get("sign") {
            Some(Value::Number(n)) if n.as_f64().unwrap_or(0.0) < 0.0 => value = -value,
            Some(Value::String(s)) if s.trim() == "-1" => value = -value,
            _ => {}
        }
        self.state.set_inventory(&market, value);
        debug!("[account] position updated {} -> {}", market, value);

        if let Some(realized) = entry.get("realized_pnl").and_then(value_to_decimal) {
            let unrealized = entry
                .get("unrealized_pnl")
                .and_then(value_to_decimal)
                .unwrap_or(Decimal::ZERO);
            let snapshot = PositionPnl {
                timestamp: now_ts(),
                market: market.clone(),
                position: value,
                realized_pnl: realized,
                unrealized_pnl: unrealized,
                total_pnl: realized + unrealized,
            };
            self.positions_journal.append(&snapshot);
            info!(
                "[account] position_pnl market={} realized={} unrealized={} total={}",
                market, realized, unrealized, snapshot.total_pnl
            );
        }
    }

    fn tracked_markets(&self) -> Vec<String> {
        let mut markets: Vec<String> = self.market_filter.clone();
        if markets.is_empty() {
            markets = self.state.get_inventory_map().into_keys().collect();
        }
        if !markets.contains(&self.default_market) {
            markets.push(self.default_market.clone());
        }
        markets
    }
}

fn fallback_delta(role: Role, maker_is_ask: bool, size: Decimal) -> Decimal {
    match role {
        Role::Maker => {
            if maker_is_ask {
                -size
            } else {
                size
            }
        }
        Role::Taker => {
            if maker_is_ask {
                size
            } else {
                -size
            }
        }
    }
}

fn int_field(entry: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(v) = entry.get(*key) {
            if let Some(i) = v.as_i64() {
                return Some(i);
            }
            if let Some(s) = v.as_str() {
                if let Ok(i) = s.parse() {
                    return Some(i);
                }
            }
        }
    }
    None
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
