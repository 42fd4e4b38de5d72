//! Periodic two-sided quoting loop.
//!
//! Per tick: read the mid, update the volatility EMA (with pause latches),
//! the PnL guard, the trend filter and the regime; derive an
//! inventory-adjusted spread and size; gate the pair through the safety
//! guard; suppress the position-increasing side above the asymmetric
//! threshold; then reconcile (cancel-then-place) under a rolling per-minute
//! cancel budget. Exchange failures alert and the loop retries next tick.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::alerts::{fire_and_forget, AlertLevel, AlertSink};
use crate::config::{GuardConfig, MakerConfig};
use crate::exchange::{OrderApi, Side};
use crate::mm::guard::SafetyGuard;
use crate::mm::messages::EnabledSides;
use crate::mm::pnl_guard::PnlGuard;
use crate::mm::regime::RegimeSwitcher;
use crate::mm::trend::{Bias, TrendFilter};
use crate::mm::volatility::VolatilityTracker;
use crate::now_ts;
use crate::state::{OrderInfo, StateStore};
use crate::telemetry::Telemetry;

const CANCEL_WINDOW_SECONDS: f64 = 60.0;

/// What one tick decided to do. Exposed for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    NoMid,
    Paused,
    Blocked,
    Throttled,
    SidesDisabled,
    CancelFailed,
    Quoted,
}

pub struct MakerEngine {
    cfg: MakerConfig,
    guard_cfg: GuardConfig,
    market: String,
    state: Arc<StateStore>,
    guard: SafetyGuard,
    exchange: Arc<dyn OrderApi>,
    telemetry: Telemetry,
    alerts: Arc<AlertSink>,
    shutdown: watch::Receiver<bool>,
    vol: VolatilityTracker,
    trend: TrendFilter,
    regime: RegimeSwitcher,
    pnl_guard: PnlGuard,
    cancel_window: VecDeque<f64>,
    throttled_until: f64,
}

impl MakerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: MakerConfig,
        guard_cfg: GuardConfig,
        state: Arc<StateStore>,
        exchange: Arc<dyn OrderApi>,
        telemetry: Telemetry,
        alerts: Arc<AlertSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let market = cfg.pair.clone();
        let guard = SafetyGuard::new(state.clone(), guard_cfg.clone());
        let vol = VolatilityTracker::new(cfg.volatility.clone());
        let trend = TrendFilter::new(cfg.trend.clone());
        let regime = RegimeSwitcher::new(cfg.regimes.clone());
        let pnl_guard = PnlGuard::new(cfg.pnl_guard.clone());
        Self {
            cfg,
            guard_cfg,
            market,
            state,
            guard,
            exchange,
            telemetry,
            alerts,
            shutdown,
            vol,
            trend,
            regime,
            pnl_guard,
            cancel_window: VecDeque::new(),
            throttled_until: 0.0,
        }
    }

    pub async fn run(mut self) {
        info!("MakerEngine started for {}", self.market);
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let delay = match self.tick().await {
                Ok(TickResult::NoMid) => {
                    debug!("[maker] waiting for mid...");
                    1.0
                }
                Ok(TickResult::Quoted) => {
                    self.telemetry.touch("quote");
                    self.cfg.refresh_seconds
                }
                Ok(_) => self.cfg.refresh_seconds,
                Err(err) => {
                    warn!("[maker] tick failed: {err}");
                    fire_and_forget(&self.alerts, AlertLevel::Error, "Maker tick failed", &err.to_string());
                    self.cfg.refresh_seconds
                }
            };
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(Duration::from_secs_f64(delay.max(0.05))) => {}
            }
        }
        info!("MakerEngine stopped");
    }

    /// One pass of the quoting algorithm.
    pub async fn tick(&mut self) -> Result<TickResult> {
        let now = now_ts();

        // step 1: mid
        let Some(mid) = self.state.get_mid(&self.market) else {
            return Ok(TickResult::NoMid);
        };
        let mid_f = mid.to_f64().unwrap_or(0.0);
        if mid_f <= 0.0 {
            return Ok(TickResult::NoMid);
        }

        let inventory = self.state.get_inventory(&self.market);
        let soft_cap = self.cfg.inventory_soft_cap;
        let inv_ratio = if soft_cap > Decimal::ZERO {
            (inventory.abs() / soft_cap).to_f64().unwrap_or(0.0).min(1.0)
        } else {
            0.0
        };

        // step 2: volatility EMA + pause latches
        let ema = self.vol.update(mid_f, now);
        self.vol.update_pause_flags(inv_ratio);
        self.telemetry.set_gauge("maker_vol_ema_bps", ema);
        if self.vol.is_paused() {
            debug!("[maker] volatility pause active (ema={ema:.2}bps)");
            self.cancel_all(now).await;
            return Ok(TickResult::Paused);
        }

        // PnL guard feeds both the regime vote and the hedger's clip shrink
        self.pnl_guard
            .check_and_update(self.state.get_fifo_realized(&self.market), now);
        let pnl_guard_active = self.pnl_guard.is_active();
        self.state.set_flag("pnl_guard_active", pnl_guard_active);
        self.telemetry
            .set_gauge("maker_pnl_guard_active", if pnl_guard_active { 1.0 } else { 0.0 });

        // step 3: trend
        self.trend.update(mid_f, now);
        let trend_decision = self.trend.decide(mid_f, inventory, soft_cap, now);
        self.telemetry.set_gauge(
            "maker_trend_bias",
            match trend_decision.bias {
                Bias::Both => 0.0,
                Bias::Ask => 1.0,
                Bias::Bid => -1.0,
            },
        );

        // step 4: regime
        let regime = self.regime.choose(
            pnl_guard_active,
            self.trend.signal_down(),
            self.trend.cooldown_active(now),
            ema,
            now,
        );
        let profile = self.regime.profile().clone();
        if self.cfg.regimes.enabled {
            self.trend.set_down_cooldown_seconds(profile.down_cooldown_seconds);
        }
        self.telemetry.set_gauge(
            "maker_regime_defensive",
            if regime == crate::mm::regime::Regime::Defensive { 1.0 } else { 0.0 },
        );

        // step 5: spread and size
        let (tier_spread_extra, tier_size_mult) = self.inventory_tier(inventory);
        let mut spread_bps = self.vol.spread_for_volatility(self.cfg.spread_bps)
            + profile.extra_spread_bps
            + trend_decision.extra_spread_bps
            + tier_spread_extra
            + self.pnl_guard.spread_adjustment_bps();
        if self.cfg.randomize_bps > 0.0 {
            let jitter = rand::thread_rng()
                .gen_range(-self.cfg.randomize_bps..=self.cfg.randomize_bps);
            spread_bps += jitter;
        }
        let spread_bps = spread_bps.max(1e-6);

        let half = mid * Decimal::from_f64(spread_bps / 20_000.0).unwrap_or(Decimal::ZERO);
        let bid = (mid - half).max(Decimal::new(1, 7));
        let ask = mid + half;

        let size = self.compute_size(mid, inventory, &profile, tier_size_mult);
        if size <= Decimal::ZERO {
            debug!("[maker] computed size is zero; skipping tick");
            return Ok(TickResult::SidesDisabled);
        }

        // step 6: safety gate
        if !self.guard.is_allowed(mid, bid, ask, &self.market) {
            self.cancel_all(now).await;
            if self.state.get_guard_block_since(&self.market).is_none() {
                fire_and_forget(
                    &self.alerts,
                    AlertLevel::Warning,
                    "Quote guard blocked",
                    &format!("market={} mid={} bid={} ask={}", self.market, mid, bid, ask),
                );
            }
            self.state.mark_guard_blocked(&self.market, now);
            sleep(Duration::from_secs_f64(
                self.guard_cfg.backoff_seconds_on_block.max(0.0),
            ))
            .await;
            return Ok(TickResult::Blocked);
        }
        self.state.clear_guard_block(&self.market);

        // step 7: asymmetric bias from inventory (overrides trend bias)
        let mut sides = match trend_decision.bias {
            Bias::Both => EnabledSides::both(),
            Bias::Ask => EnabledSides { bid: false, ask: true },
            Bias::Bid => EnabledSides { bid: true, ask: false },
        };
        let asym = self.cfg.inventory.asymmetric_threshold_units;
        if asym > Decimal::ZERO && inventory.abs() > asym {
            if inventory > Decimal::ZERO {
                sides.bid = false;
            } else {
                sides.ask = false;
            }
        }
        if sides.none() {
            self.cancel_all(now).await;
            return Ok(TickResult::SidesDisabled);
        }

        // step 8: reconcile under the cancel budget
        if now < self.throttled_until {
            debug!("[maker] cancel budget exhausted; skipping quoting");
            return Ok(TickResult::Throttled);
        }
        let tracked: Vec<u64> = self
            .state
            .get_orders(Some(&self.market))
            .into_keys()
            .collect();
        for id in tracked {
            if !self.try_consume_cancel(now) {
                return Ok(TickResult::Throttled);
            }
            match self.exchange.cancel_order(&self.market, id).await {
                Ok(()) => {
                    self.state.remove_order(id);
                    self.telemetry.inc_counter("maker_cancels_total", 1.0);
                }
                Err(err) => {
                    warn!("[maker] cancel {id} failed: {err}");
                    fire_and_forget(
                        &self.alerts,
                        AlertLevel::Warning,
                        "Cancel failed",
                        &err.to_string(),
                    );
                    // keep the order tracked and retry next tick
                    return Ok(TickResult::CancelFailed);
                }
            }
        }

        for (enabled, side, price) in
            [(sides.bid, Side::Bid, bid), (sides.ask, Side::Ask, ask)]
        {
            if !enabled {
                continue;
            }
            match self
                .exchange
                .create_post_only_limit(&self.market, side, price, size, false)
                .await
            {
                Ok(placed) => {
                    self.state.add_order(
                        placed.client_order_id,
                        OrderInfo {
                            market: self.market.clone(),
                            side,
                            price,
                            size,
                            placed_at: now,
                        },
                    );
                    self.telemetry.inc_counter("maker_orders_total", 1.0);
                }
                Err(err) => {
                    warn!("[maker] {} placement failed: {err}", side.as_str());
                    fire_and_forget(
                        &self.alerts,
                        AlertLevel::Warning,
                        "Order rejected",
                        &err.to_string(),
                    );
                }
            }
        }

        info!(
            "[{}] mid={} | bid={} | ask={} | spread={:.2}bps | size={}",
            self.market, mid, bid, ask, spread_bps, size
        );
        self.telemetry.set_gauge("maker_spread_bps", spread_bps);
        self.telemetry
            .set_gauge("maker_quote_size", size.to_f64().unwrap_or(0.0));

        // step 9 (heartbeat) is touched by the run loop on Quoted
        Ok(TickResult::Quoted)
    }

    /// Tiered spread widening and size reduction on |inventory|.
    fn inventory_tier(&self, inventory: Decimal) -> (f64, f64) {
        let cfg = &self.cfg.inventory;
        if !cfg.enabled {
            return (0.0, 1.0);
        }
        let abs = inventory.abs();
        let spread = if abs > cfg.threshold_high {
            cfg.spread_bps_high
        } else if abs > cfg.threshold_med {
            cfg.spread_bps_med
        } else if abs > cfg.threshold_low {
            cfg.spread_bps_low
        } else {
            0.0
        };
        let mult = if abs > cfg.threshold_med {
            cfg.size_mult_med
        } else if abs > cfg.threshold_low {
            cfg.size_mult_low
        } else {
            1.0
        };
        (spread, mult)
    }

    fn compute_size(
        &self,
        mid: Decimal,
        inventory: Decimal,
        profile: &crate::config::RegimeProfileConfig,
        tier_mult: f64,
    ) -> Decimal {
        let mut size =
            self.cfg.size * Decimal::from_f64(profile.size_multiplier).unwrap_or(Decimal::ONE);

        // the inventory-ratio curve caps size between size_max and size_min
        let soft_cap = self.cfg.inventory_soft_cap;
        let ratio = if soft_cap > Decimal::ZERO {
            (inventory.abs() / soft_cap).min(Decimal::ONE)
        } else {
            Decimal::ZERO
        };
        let cap = self.cfg.size_max - (self.cfg.size_max - self.cfg.size_min) * ratio;
        size = size.min(cap);

        let factor = self.vol.size_factor() * tier_mult * self.pnl_guard.size_multiplier();
        size *= Decimal::from_f64(factor).unwrap_or(Decimal::ONE);

        // exchange floors
        size = size.max(self.cfg.exchange_min_size);
        if self.cfg.exchange_min_notional > Decimal::ZERO && mid > Decimal::ZERO {
            size = size.max(self.cfg.exchange_min_notional / mid);
        }

        // quantize up to the lot step
        if self.cfg.size_scale > 0 {
            let step = Decimal::ONE / Decimal::from(self.cfg.size_scale);
            let lots = (size / step).ceil();
            size = lots * step;
        }
        size
    }

    /// Consume one unit of the rolling cancel budget, or flip into the
    /// throttled state until the window rolls.
    fn try_consume_cancel(&mut self, now: f64) -> bool {
        while let Some(&front) = self.cancel_window.front() {
            if now - front > CANCEL_WINDOW_SECONDS {
                self.cancel_window.pop_front();
            } else {
                break;
            }
        }
        if self.cancel_window.len() >= self.cfg.limits.max_cancels as usize {
            self.throttled_until = self
                .cancel_window
                .front()
                .map(|t| t + CANCEL_WINDOW_SECONDS)
                .unwrap_or(now);
            warn!(
                "[maker] cancel budget ({}/min) exhausted; throttled until {:.0}",
                self.cfg.limits.max_cancels, self.throttled_until
            );
            self.telemetry.set_gauge("maker_cancel_throttled", 1.0);
            return false;
        }
        self.cancel_window.push_back(now);
        self.telemetry.set_gauge("maker_cancel_throttled", 0.0);
        true
    }

    /// Cancel every tracked order on this market, budget permitting.
    async fn cancel_all(&mut self, now: f64) {
        let tracked: Vec<u64> = self
            .state
            .get_orders(Some(&self.market))
            .into_keys()
            .collect();
        for id in tracked {
            if !self.try_consume_cancel(now) {
                return;
            }
            match self.exchange.cancel_order(&self.market, id).await {
                Ok(()) => {
                    self.state.remove_order(id);
                    self.telemetry.inc_counter("maker_cancels_total", 1.0);
                }
                Err(err) => {
                    warn!("[maker] cancel {id} failed: {err}");
                    return;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PlacedOrder;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockExchange {
        placed: Mutex<Vec<PlacedOrder>>,
        cancels: Mutex<Vec<u64>>,
        next_id: AtomicU64,
        fail_cancels: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl OrderApi for MockExchange {
        async fn create_limit_order(
            &self,
            market: &str,
            side: Side,
            price: Decimal,
            size: Decimal,
            _reduce_only: bool,
            _post_only: bool,
            _tif: crate::exchange::TimeInForce,
        ) -> Result<PlacedOrder> {
            let order = PlacedOrder {
                market: market.to_string(),
                side,
                price,
                size,
                client_order_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                tx_hash: None,
            };
            self.placed.lock().unwrap().push(order.clone());
            Ok(order)
        }

        async fn cancel_order(&self, _market: &str, client_order_id: u64) -> Result<()> {
            if self.fail_cancels.load(Ordering::SeqCst) {
                anyhow::bail!("cancel rejected");
            }
            self.cancels.lock().unwrap().push(client_order_id);
            Ok(())
        }
    }

    fn base_cfg() -> MakerConfig {
        MakerConfig {
            pair: "market:1".into(),
            size: dec!(1.0),
            size_min: dec!(0.5),
            size_max: dec!(1.5),
            spread_bps: 10.0,
            refresh_seconds: 0.01,
            randomize_bps: 0.0,
            size_scale: 100,
            price_scale: 100,
            inventory_soft_cap: dec!(1.0),
            exchange_min_size: dec!(0.1),
            exchange_min_notional: Decimal::ZERO,
            ..MakerConfig::default()
        }
    }

    fn guard_cfg() -> GuardConfig {
        GuardConfig {
            price_band_bps: dec!(50),
            max_position_units: dec!(10),
            max_inventory_notional: dec!(1_000_000),
            backoff_seconds_on_block: 0.0,
            ..GuardConfig::default()
        }
    }

    fn engine(
        cfg: MakerConfig,
        guard: GuardConfig,
    ) -> (MakerEngine, Arc<StateStore>, Arc<MockExchange>) {
        let state = Arc::new(StateStore::new());
        let exchange = Arc::new(MockExchange::default());
        let (_tx, shutdown) = watch::channel(false);
        let engine = MakerEngine::new(
            cfg,
            guard,
            state.clone(),
            exchange.clone(),
            Telemetry::new(false, 0),
            AlertSink::new(None, false, "test"),
            shutdown,
        );
        (engine, state, exchange)
    }

    #[tokio::test]
    async fn test_happy_path_quote_tick() {
        let (mut engine, state, exchange) = engine(base_cfg(), guard_cfg());
        state.set_mid("market:1", dec!(100.000));

        let result = engine.tick().await.unwrap();
        assert_eq!(result, TickResult::Quoted);

        let placed = exchange.placed.lock().unwrap();
        assert_eq!(placed.len(), 2);
        let bid = placed.iter().find(|o| o.side == Side::Bid).unwrap();
        let ask = placed.iter().find(|o| o.side == Side::Ask).unwrap();
        assert_eq!(bid.price, dec!(99.95));
        assert_eq!(ask.price, dec!(100.05));
        assert_eq!(bid.size, dec!(1.0));
        assert_eq!(ask.size, dec!(1.0));
        // both tracked in the store
        assert_eq!(state.get_orders(Some("market:1")).len(), 2);
    }

    #[tokio::test]
    async fn test_no_mid_no_quotes() {
        let (mut engine, _state, exchange) = engine(base_cfg(), guard_cfg());
        let result = engine.tick().await.unwrap();
        assert_eq!(result, TickResult::NoMid);
        assert!(exchange.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guard_denial_blocks_and_marks() {
        let cfg = base_cfg();
        let guard = GuardConfig { max_position_units: dec!(0.01), ..guard_cfg() };
        let (mut engine, state, exchange) = engine(cfg, guard);
        state.set_mid("market:1", dec!(100));
        state.set_inventory("market:1", dec!(5)); // breaches the unit cap

        let result = engine.tick().await.unwrap();
        assert_eq!(result, TickResult::Blocked);
        assert!(exchange.placed.lock().unwrap().is_empty());
        assert!(state.get_guard_block_since("market:1").is_some());
    }

    #[tokio::test]
    async fn test_guard_pass_clears_block_marker() {
        let (mut engine, state, _exchange) = engine(base_cfg(), guard_cfg());
        state.set_mid("market:1", dec!(100));
        state.mark_guard_blocked("market:1", 1.0);
        engine.tick().await.unwrap();
        assert!(state.get_guard_block_since("market:1").is_none());
    }

    #[tokio::test]
    async fn test_asymmetric_long_suppresses_bid() {
        let mut cfg = base_cfg();
        cfg.inventory.asymmetric_threshold_units = dec!(0.01);
        // keep tier adjustments away from this test
        cfg.inventory.threshold_low = dec!(10);
        cfg.inventory.threshold_med = dec!(10);
        cfg.inventory.threshold_high = dec!(10);
        let (mut engine, state, exchange) = engine(cfg, guard_cfg());
        state.set_mid("market:1", dec!(100));
        state.set_inventory("market:1", dec!(0.02));

        let result = engine.tick().await.unwrap();
        assert_eq!(result, TickResult::Quoted);
        let placed = exchange.placed.lock().unwrap();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Ask);
    }

    #[tokio::test]
    async fn test_asymmetric_short_suppresses_ask() {
        let mut cfg = base_cfg();
        cfg.inventory.asymmetric_threshold_units = dec!(0.01);
        cfg.inventory.threshold_low = dec!(10);
        cfg.inventory.threshold_med = dec!(10);
        cfg.inventory.threshold_high = dec!(10);
        let (mut engine, state, exchange) = engine(cfg, guard_cfg());
        state.set_mid("market:1", dec!(100));
        state.set_inventory("market:1", dec!(-0.02));

        engine.tick().await.unwrap();
        let placed = exchange.placed.lock().unwrap();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, Side::Bid);
    }

    #[tokio::test]
    async fn test_cancel_budget_throttles_after_max() {
        let mut cfg = base_cfg();
        cfg.limits.max_cancels = 5;
        let (mut engine, state, exchange) = engine(cfg, guard_cfg());
        state.set_mid("market:1", dec!(100));

        // tick 1: no cancels, 2 orders; ticks 2-3: 2 cancels each;
        // tick 4: 5th cancel consumes the budget, 6th flips to throttled
        for _ in 0..6 {
            engine.tick().await.unwrap();
        }
        assert_eq!(exchange.cancels.lock().unwrap().len(), 5);
        // no further quoting while throttled
        let placed_before = exchange.placed.lock().unwrap().len();
        let result = engine.tick().await.unwrap();
        assert_eq!(result, TickResult::Throttled);
        assert_eq!(exchange.placed.lock().unwrap().len(), placed_before);
    }

    #[tokio::test]
    async fn test_cancel_failure_keeps_order_tracked() {
        let (mut engine, state, exchange) = engine(base_cfg(), guard_cfg());
        state.set_mid("market:1", dec!(100));
        engine.tick().await.unwrap();
        assert_eq!(state.get_orders(Some("market:1")).len(), 2);

        exchange.fail_cancels.store(true, Ordering::SeqCst);
        let result = engine.tick().await.unwrap();
        assert_eq!(result, TickResult::CancelFailed);
        // nothing removed, nothing new placed
        assert_eq!(state.get_orders(Some("market:1")).len(), 2);
        assert_eq!(exchange.placed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_size_shrinks_with_inventory_ratio() {
        let mut cfg = base_cfg();
        cfg.inventory.enabled = false;
        cfg.inventory.asymmetric_threshold_units = Decimal::ZERO;
        let (mut engine, state, exchange) = engine(cfg, guard_cfg());
        state.set_mid("market:1", dec!(100));
        // |inv| = soft_cap → cap = size_min
        state.set_inventory("market:1", dec!(1.0));

        engine.tick().await.unwrap();
        let placed = exchange.placed.lock().unwrap();
        assert!(!placed.is_empty());
        assert_eq!(placed[0].size, dec!(0.5));
    }

    #[tokio::test]
    async fn test_size_floors_at_exchange_minimums() {
        let mut cfg = base_cfg();
        cfg.size = dec!(0.0001);
        cfg.size_min = dec!(0.0001);
        cfg.size_max = dec!(0.0002);
        cfg.exchange_min_size = dec!(0.1);
        let (mut engine, state, exchange) = engine(cfg, guard_cfg());
        state.set_mid("market:1", dec!(100));
        engine.tick().await.unwrap();
        assert_eq!(exchange.placed.lock().unwrap()[0].size, dec!(0.1));
    }

    #[tokio::test]
    async fn test_min_notional_floor_quantized_up() {
        let mut cfg = base_cfg();
        cfg.exchange_min_notional = dec!(25);
        cfg.size = dec!(0.1);
        cfg.size_min = dec!(0.1);
        cfg.size_max = dec!(0.3);
        cfg.exchange_min_size = dec!(0.01);
        cfg.size_scale = 100;
        let (mut engine, state, exchange) = engine(cfg, guard_cfg());
        state.set_mid("market:1", dec!(99));
        engine.tick().await.unwrap();
        // 25/99 = 0.2525... → ceil to lot step 0.01 → 0.26
        assert_eq!(exchange.placed.lock().unwrap()[0].size, dec!(0.26));
    }

    #[tokio::test]
    async fn test_vol_pause_cancels_and_skips() {
        let mut cfg = base_cfg();
        cfg.volatility.enabled = true;
        cfg.volatility.high_vol_pause_threshold_bps = 5.0;
        cfg.volatility.high_vol_resume_threshold_bps = 1.0;
        cfg.volatility.ema_halflife_seconds = 1.0;
        let (mut engine, state, exchange) = engine(cfg, guard_cfg());

        state.set_mid("market:1", dec!(100));
        engine.tick().await.unwrap(); // first tick initializes the ema, quotes
        assert_eq!(state.get_orders(Some("market:1")).len(), 2);

        // a violent move spikes the ema far above the pause threshold
        state.set_mid("market:1", dec!(105));
        engine.vol.update(105.0, now_ts() + 5.0);
        let result = engine.tick().await.unwrap();
        assert_eq!(result, TickResult::Paused);
        // resting orders were pulled
        assert!(state.get_orders(Some("market:1")).is_empty());
        assert_eq!(exchange.cancels.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pnl_guard_widens_spread_and_cuts_size() {
        let mut cfg = base_cfg();
        cfg.pnl_guard.enabled = true;
        cfg.pnl_guard.realized_floor_quote = dec!(-0.1);
        cfg.pnl_guard.trigger_consecutive = 1;
        cfg.pnl_guard.widen_bps = 6.0;
        cfg.pnl_guard.size_multiplier = 0.85;
        cfg.pnl_guard.check_interval_seconds = 0.0;
        let (mut engine, state, exchange) = engine(cfg, guard_cfg());
        state.set_mid("market:1", dec!(100));
        state.set_fifo_realized("market:1", dec!(-5));

        engine.tick().await.unwrap();
        assert!(state.get_flag("pnl_guard_active"));
        let placed = exchange.placed.lock().unwrap();
        let bid = placed.iter().find(|o| o.side == Side::Bid).unwrap();
        // spread = 10 + 6 = 16bps → half = 0.08
        assert_eq!(bid.price, dec!(99.92));
        assert_eq!(bid.size, dec!(0.85));
    }
}
