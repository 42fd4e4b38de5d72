//! Market-stats WebSocket consumer with synthetic fallback.
//!
//! Connects, subscribes (global stats channel plus one channel per maker
//! market), answers pings, and routes every frame through a tolerant
//! extractor into `StateStore` mids. Repeated connection failures demote
//! the listener to a synthetic drifting-mid generator for the rest of the
//! process lifetime, so the rest of the stack keeps exercising.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::alerts::AlertSink;
use crate::config::{CaptureConfig, SyntheticConfig, WsConfig};
use crate::now_ts;
use crate::state::StateStore;
use crate::telemetry::Telemetry;

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────
// Tolerant mid router
// ─────────────────────────────────────────────────────────

/// Extracts `(market, mid)` pairs from the frame shapes the venue has been
/// seen to emit and applies them to the store.
pub struct MidRouter {
    state: Arc<StateStore>,
    log_interval: f64,
    last_log_ts: f64,
}

impl MidRouter {
    pub fn new(state: Arc<StateStore>, log_interval: f64) -> Self {
        Self { state, log_interval, last_log_ts: 0.0 }
    }

    /// Route one decoded frame; returns how many mids were applied.
    pub fn route(&mut self, frame: &Value, ts: f64) -> usize {
        // shape 4: top-level array of entries
        if let Some(entries) = frame.as_array() {
            return self.apply_entries(entries, ts);
        }

        // shape 1: "market_stats" as a list or a single entry object
        if let Some(stats) = frame.get("market_stats") {
            let applied = match stats {
                Value::Array(entries) => self.apply_entries(entries, ts),
                Value::Object(_) => self.apply_entry(stats, ts) as usize,
                _ => 0,
            };
            if applied > 0 {
                return applied;
            }
        }

        // shapes 2 and 3: "data" as a list, or wrapping updates/markets/rows
        if let Some(data) = frame.get("data") {
            if let Some(entries) = data.as_array() {
                let applied = self.apply_entries(entries, ts);
                if applied > 0 {
                    return applied;
                }
            } else if let Some(obj) = data.as_object() {
                for key in ["updates", "markets", "rows"] {
                    if let Some(entries) = obj.get(key).and_then(Value::as_array) {
                        let applied = self.apply_entries(entries, ts);
                        if applied > 0 {
                            return applied;
                        }
                    }
                }
            }
        }

        debug!("no mids extracted from frame");
        0
    }

    fn apply_entries(&mut self, entries: &[Value], ts: f64) -> usize {
        entries.iter().filter(|e| self.apply_entry(e, ts)).count()
    }

    fn apply_entry(&mut self, entry: &Value, ts: f64) -> bool {
        let Some((market, mid)) = derive_mid_from_entry(entry) else {
            return false;
        };
        self.state.set_mid(&market, mid);
        if self.log_interval <= 0.0
            || self.last_log_ts == 0.0
            || ts - self.last_log_ts >= self.log_interval
        {
            self.last_log_ts = ts;
            info!("[router] mid updated {} -> {}", market, mid);
        } else {
            debug!("[router] mid updated {} -> {}", market, mid);
        }
        true
    }
}

/// Mid-field selection order: mark_price → markPrice → mid, else the
/// average of index and last price when both are present.
pub fn derive_mid_from_entry(entry: &Value) -> Option<(String, Decimal)> {
    let obj = entry.as_object()?;

    let market_id = obj
        .get("market_id")
        .or_else(|| obj.get("marketId"))
        .or_else(|| obj.get("id"))
        .or_else(|| obj.get("market"))?;
    let market = normalize_market(market_id)?;

    for key in ["mark_price", "markPrice", "mid"] {
        if let Some(mid) = obj.get(key).and_then(value_to_decimal) {
            return Some((market, mid));
        }
    }

    let index = ["index_price", "indexPrice", "index"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(value_to_decimal));
    let last = ["last_price", "lastPrice", "last"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(value_to_decimal));
    if let (Some(index), Some(last)) = (index, last) {
        return Some((market, (index + last) / Decimal::from(2)));
    }
    None
}

/// Canonical `market:<n>` handle from whatever the feed used as an id.
pub fn normalize_market(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) if !s.is_empty() => {
            if s.starts_with("market:") {
                Some(s.clone())
            } else {
                Some(format!("market:{s}"))
            }
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(format!("market:{i}"))
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| format!("market:{}", f as i64))
            }
        }
        _ => None,
    }
}

pub(crate) fn value_to_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────
// Listener actor
// ─────────────────────────────────────────────────────────

pub struct MarketDataListener {
    ws: WsConfig,
    capture: CaptureConfig,
    synthetic: SyntheticConfig,
    channels: Vec<String>,
    router: MidRouter,
    telemetry: Telemetry,
    alerts: Arc<AlertSink>,
    shutdown: watch::Receiver<bool>,
    subscribed: HashSet<String>,
    consecutive_failures: u32,
}

impl MarketDataListener {
    pub fn new(
        ws: WsConfig,
        capture: CaptureConfig,
        synthetic: SyntheticConfig,
        maker_pair: &str,
        state: Arc<StateStore>,
        telemetry: Telemetry,
        alerts: Arc<AlertSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut channels = vec!["market_stats/all".to_string()];
        for extra in &ws.channels {
            if !channels.contains(extra) {
                channels.push(extra.clone());
            }
        }
        // auto-subscribe the maker's market channel
        if let Some(suffix) = maker_pair.strip_prefix("market:") {
            let derived = format!("market_stats/{suffix}");
            if !channels.contains(&derived) {
                info!("[listener] auto-subscribe channel from maker config: {derived}");
                channels.push(derived);
            }
        }
        let log_interval = ws.log_mid_interval_s;
        if capture.write_raw {
            if let Some(parent) = std::path::Path::new(&capture.raw_path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        Self {
            ws,
            capture,
            synthetic,
            channels,
            router: MidRouter::new(state, log_interval),
            telemetry,
            alerts,
            shutdown,
            subscribed: HashSet::new(),
            consecutive_failures: 0,
        }
    }

    pub async fn run(mut self) {
        let Some(url) = self.ws.url.clone() else {
            info!(
                "[feeder] no WS configured; starting synthetic feed for {} from {}",
                self.synthetic.market, self.synthetic.mid_start
            );
            self.run_synthetic().await;
            return;
        };
        if url::Url::parse(&url).is_err() {
            warn!("[listener] unparseable WS url {url}; starting synthetic feed");
            self.run_synthetic().await;
            return;
        }

        while !*self.shutdown.borrow() {
            match self.run_ws_once(&url).await {
                Ok(()) => {
                    self.consecutive_failures = 0;
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                Err(err) => {
                    self.consecutive_failures += 1;
                    warn!(
                        "[listener] socket error on {url}: {err} (fail #{})",
                        self.consecutive_failures
                    );
                    self.alerts.warning("WS disconnected", &err.to_string()).await;
                    if self.ws.fallback_on_fail
                        && self.consecutive_failures >= self.ws.max_failures
                    {
                        warn!("[listener] max failures reached; falling back to synthetic feed");
                        self.alerts
                            .warning(
                                "WS fallback to synthetic",
                                &format!("failures={}", self.consecutive_failures),
                            )
                            .await;
                        // permanent for the process lifetime, no flapping back
                        self.run_synthetic().await;
                        return;
                    }
                }
            }
            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn run_ws_once(&mut self, url: &str) -> anyhow::Result<()> {
        info!("[listener] connecting {url}");
        let (ws, _resp) = match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => anyhow::bail!("WS connect error: {err}"),
            Err(_) => anyhow::bail!("WS connection timeout"),
        };
        self.alerts.info("WS connected", url).await;
        let (mut write, mut read) = ws.split();

        self.subscribed.clear();
        self.send_subscriptions(&mut write).await;

        loop {
            let mut shutdown = self.shutdown.clone();
            let msg = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                msg = timeout(IDLE_TIMEOUT, read.next()) => msg,
            };
            let msg = match msg {
                Ok(m) => m,
                Err(_) => {
                    // no frame in 60s; force a reconnect
                    warn!("[listener] no message received in 60s, reconnecting");
                    self.telemetry.touch("ws");
                    anyhow::bail!("idle timeout");
                }
            };
            match msg {
                Some(Ok(Message::Text(text))) => {
                    let ts = now_ts();
                    self.telemetry.touch("ws");
                    self.capture_raw(&text, ts);
                    let Ok(obj) = serde_json::from_str::<Value>(&text) else {
                        debug!("[listener] unable to parse frame as JSON");
                        continue;
                    };
                    match obj.get("type").and_then(Value::as_str) {
                        Some("connected") => {
                            self.send_subscriptions(&mut write).await;
                        }
                        Some("ping") => {
                            let pong = json!({"type": "pong"}).to_string();
                            if let Err(err) = write.send(Message::Text(pong)).await {
                                debug!("[listener] failed to send pong: {err}");
                            }
                        }
                        _ => {
                            self.router.route(&obj, ts);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => anyhow::bail!("closed by server"),
                Some(Ok(_)) => {}
                Some(Err(err)) => anyhow::bail!("WS error: {err}"),
                None => anyhow::bail!("stream ended"),
            }
        }
    }

    async fn send_subscriptions<S>(&mut self, write: &mut S)
    where
        S: SinkExt<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        for channel in self.channels.clone() {
            if self.subscribed.contains(&channel) {
                continue;
            }
            let mut payload = json!({"type": "subscribe", "channel": channel});
            if let Some(token) = &self.ws.auth_token {
                payload["auth"] = json!(token);
            }
            match write.send(Message::Text(payload.to_string())).await {
                Ok(()) => {
                    info!("[listener] sent subscription: {channel}");
                    self.subscribed.insert(channel);
                }
                Err(err) => warn!("[listener] failed to subscribe {channel}: {err}"),
            }
        }
    }

    fn capture_raw(&self, raw: &str, ts: f64) {
        if !self.capture.write_raw {
            return;
        }
        let line = json!({"ts": ts, "raw": raw}).to_string();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.capture.raw_path)
            .and_then(|mut fh| writeln!(fh, "{line}"));
        if let Err(err) = result {
            debug!("[listener] capture failed: {err}");
        }
    }

    // ─────────────────── synthetic mode ───────────────────

    async fn run_synthetic(mut self) {
        use rand::Rng;
        let mut mid = self.synthetic.mid_start;
        let mut t = 0.0_f64;
        let interval = Duration::from_secs_f64(self.synthetic.interval_seconds.max(0.05));
        while !*self.shutdown.borrow() {
            let (drift, jitter) = {
                let mut rng = rand::thread_rng();
                (
                    self.synthetic.tick_step * (rng.gen::<f64>() - 0.5),
                    self.synthetic.tick_jitter * rng.gen_range(-1.0..=1.0),
                )
            };
            let wave = 3.0 * self.synthetic.tick_step * (0.5 * (1.0 + (t / 9.0).sin()));
            mid = (mid + drift + jitter + wave).max(1.0);

            let ts = now_ts();
            let frame = json!({
                "channel": "market_stats:all",
                "type": "update/market_stats",
                "ts": ts,
                "data": [{"market": self.synthetic.market, "mid": format!("{mid:.4}")}],
            });
            self.telemetry.touch("ws");
            self.capture_raw(&frame.to_string(), ts);
            self.router.route(&frame, ts);

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(interval) => {}
            }
            t += self.synthetic.interval_seconds;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn router() -> (Arc<StateStore>, MidRouter) {
        let state = Arc::new(StateStore::new());
        let router = MidRouter::new(state.clone(), 0.0);
        (state, router)
    }

    #[test]
    fn test_shape_market_stats_list() {
        let (state, mut router) = router();
        let frame = json!({
            "type": "update/market_stats",
            "market_stats": [
                {"market_id": 1, "mark_price": "100.5"},
                {"market_id": 2, "mark_price": "250.25"}
            ]
        });
        assert_eq!(router.route(&frame, 0.0), 2);
        assert_eq!(state.get_mid("market:1"), Some(dec!(100.5)));
        assert_eq!(state.get_mid("market:2"), Some(dec!(250.25)));
    }

    #[test]
    fn test_shape_market_stats_single_object() {
        let (state, mut router) = router();
        let frame = json!({
            "market_stats": {"market_id": "7", "mark_price": 99.5}
        });
        assert_eq!(router.route(&frame, 0.0), 1);
        assert_eq!(state.get_mid("market:7"), Some(dec!(99.5)));
    }

    #[test]
    fn test_shape_data_list_with_mid() {
        let (state, mut router) = router();
        let frame = json!({
            "data": [{"market": "market:3", "mid": "42.1"}]
        });
        assert_eq!(router.route(&frame, 0.0), 1);
        assert_eq!(state.get_mid("market:3"), Some(dec!(42.1)));
    }

    #[test]
    fn test_shape_data_wrapped_updates() {
        let (state, mut router) = router();
        for key in ["updates", "markets", "rows"] {
            let frame = json!({
                "data": {key: [{"id": 9, "markPrice": "10"}]}
            });
            assert_eq!(router.route(&frame, 0.0), 1, "wrapper key {key}");
        }
        assert_eq!(state.get_mid("market:9"), Some(dec!(10)));
    }

    #[test]
    fn test_shape_top_level_array() {
        let (state, mut router) = router();
        let frame = json!([{"marketId": 4, "mid": 7.25}]);
        assert_eq!(router.route(&frame, 0.0), 1);
        assert_eq!(state.get_mid("market:4"), Some(dec!(7.25)));
    }

    #[test]
    fn test_index_last_average_fallback() {
        let (state, mut router) = router();
        let frame = json!({
            "data": [{"market_id": 5, "index_price": "100", "last_price": "102"}]
        });
        assert_eq!(router.route(&frame, 0.0), 1);
        assert_eq!(state.get_mid("market:5"), Some(dec!(101)));
    }

    #[test]
    fn test_mark_price_preferred_over_average() {
        let (state, mut router) = router();
        let frame = json!({
            "data": [{"market_id": 5, "mark_price": "99", "index_price": "100", "last_price": "102"}]
        });
        router.route(&frame, 0.0);
        assert_eq!(state.get_mid("market:5"), Some(dec!(99)));
    }

    #[test]
    fn test_unknown_frame_is_dropped_quietly() {
        let (state, mut router) = router();
        let frame = json!({"type": "subscribed", "channel": "market_stats/all"});
        assert_eq!(router.route(&frame, 0.0), 0);
        assert!(state.get_inventory_map().is_empty());
    }

    #[test]
    fn test_entry_without_price_or_only_index_is_skipped() {
        let (_, mut router) = router();
        assert_eq!(router.route(&json!({"data": [{"market_id": 1}]}), 0.0), 0);
        assert_eq!(
            router.route(&json!({"data": [{"market_id": 1, "index_price": "100"}]}), 0.0),
            0
        );
    }

    #[test]
    fn test_normalize_market_variants() {
        assert_eq!(normalize_market(&json!("market:3")).unwrap(), "market:3");
        assert_eq!(normalize_market(&json!("3")).unwrap(), "market:3");
        assert_eq!(normalize_market(&json!(3)).unwrap(), "market:3");
        assert_eq!(normalize_market(&json!(3.0)).unwrap(), "market:3");
        assert!(normalize_market(&json!(3.5)).is_none());
        assert!(normalize_market(&json!("")).is_none());
    }
}
