//! Inventory hedger.
//!
//! Event-driven: woken by fill notifications from the account listener or
//! by its own poll timer. When |inventory| breaches the trigger band (and
//! the notional trigger, when configured), it works the position back
//! toward target with a passive reduce-only attempt first, falling through
//! to aggressive reduce-only IOC under a slippage cap. Cooldowns pace
//! repeat hedges; a persistent guard block escalates to emergency mode.
//!
//! In dry-run the reduction is simulated (inventory delta + ledger event
//! tagged `hedger`) so paper runs exercise the full loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::alerts::{fire_and_forget, AlertLevel, AlertSink};
use crate::config::HedgerConfig;
use crate::exchange::{OrderApi, Side, TimeInForce};
use crate::ledger::{FillEvent, FillSource, MetricsLedger, Role};
use crate::mm::messages::FillNotice;
use crate::now_ts;
use crate::state::{OrderInfo, StateStore};
use crate::telemetry::Telemetry;

pub struct Hedger {
    cfg: HedgerConfig,
    market: String,
    dry_run: bool,
    taker_fee_rate: Decimal,
    state: Arc<StateStore>,
    exchange: Arc<dyn OrderApi>,
    ledger: Arc<MetricsLedger>,
    telemetry: Telemetry,
    alerts: Arc<AlertSink>,
    fills_rx: mpsc::Receiver<FillNotice>,
    shutdown: watch::Receiver<bool>,
    over_trigger_since: Option<f64>,
    cooldown_until: f64,
}

impl Hedger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: HedgerConfig,
        maker_pair: &str,
        dry_run: bool,
        taker_fee_rate: Decimal,
        state: Arc<StateStore>,
        exchange: Arc<dyn OrderApi>,
        ledger: Arc<MetricsLedger>,
        telemetry: Telemetry,
        alerts: Arc<AlertSink>,
        fills_rx: mpsc::Receiver<FillNotice>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let market = cfg.market.clone().unwrap_or_else(|| maker_pair.to_string());
        Self {
            cfg,
            market,
            dry_run,
            taker_fee_rate,
            state,
            exchange,
            ledger,
            telemetry,
            alerts,
            fills_rx,
            shutdown,
            over_trigger_since: None,
            cooldown_until: 0.0,
        }
    }

    pub async fn run(mut self) {
        if !self.cfg.enabled {
            info!("[hedger] disabled");
            return;
        }
        info!(
            "[hedger] started for {} trigger={} target={} clip={} dry_run={}",
            self.market,
            self.cfg.trigger_units,
            self.cfg.target_units,
            self.cfg.max_clip_units,
            self.dry_run,
        );
        let mut poll =
            tokio::time::interval(Duration::from_secs_f64(self.cfg.poll_interval_seconds.max(0.1)));
        let mut fills_closed = false;
        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.changed() => break,
                notice = self.fills_rx.recv(), if !fills_closed => {
                    match notice {
                        Some(notice) => debug!("[hedger] woken by fill on {}", notice.market),
                        None => fills_closed = true,
                    }
                }
                _ = poll.tick() => {}
            }
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(err) = self.evaluate().await {
                warn!("[hedger] evaluation failed: {err}");
                fire_and_forget(&self.alerts, AlertLevel::Error, "Hedger failed", &err.to_string());
            }
        }
        info!("[hedger] stopped");
    }

    /// One control-loop pass. Public for tests.
    pub async fn evaluate(&mut self) -> Result<()> {
        let now = now_ts();
        let inventory = self.state.get_inventory(&self.market);
        let Some(mid) = self.state.get_mid(&self.market) else {
            return Ok(());
        };

        // both triggers must be exceeded when a notional trigger is set
        let over_units = inventory.abs() > self.cfg.trigger_units;
        let over = match self.cfg.trigger_notional {
            Some(notional) if notional > Decimal::ZERO => {
                over_units && inventory.abs() * mid > notional
            }
            _ => over_units,
        };
        if !over {
            self.over_trigger_since = None;
            return Ok(());
        }
        if self.over_trigger_since.is_none() {
            self.over_trigger_since = Some(now);
        }

        let emergency = self
            .state
            .get_guard_block_since(&self.market)
            .map(|since| now - since >= self.cfg.guard_emergency_seconds)
            .unwrap_or(false);
        if emergency {
            // a persistently blocked maker cannot quote its way out; act now
            self.cooldown_until = 0.0;
        }
        if now < self.cooldown_until {
            return Ok(());
        }

        let excess = inventory.abs() - self.cfg.target_units;
        if excess <= Decimal::ZERO {
            return Ok(());
        }
        let mut clip = excess.min(self.cfg.max_clip_units);
        if self.state.get_flag("pnl_guard_active") {
            clip *= Decimal::from_f64(self.cfg.guard_clip_multiplier).unwrap_or(Decimal::ONE);
        }
        if emergency {
            clip *=
                Decimal::from_f64(self.cfg.guard_emergency_clip_multiplier).unwrap_or(Decimal::ONE);
        }
        if clip <= Decimal::ZERO {
            return Ok(());
        }
        let reduce_side = if inventory > Decimal::ZERO { Side::Ask } else { Side::Bid };

        let over_duration = now - self.over_trigger_since.unwrap_or(now);
        let mut reduced = false;

        if self.dry_run {
            reduced = self.simulate_reduction(mid, inventory, clip, reduce_side, emergency);
        } else {
            if !emergency
                && self.cfg.prefer_passive
                && over_duration < self.cfg.passive_timeout_seconds
            {
                reduced = self.try_passive(mid, inventory, clip, reduce_side).await;
            }
            if !reduced {
                reduced = self.aggressive(mid, clip, reduce_side, emergency).await;
            }
        }

        if reduced {
            self.telemetry.touch("hedge");
            let cooldown = if emergency {
                self.cfg.cooldown_seconds / 2.0
            } else {
                self.cfg.cooldown_seconds
            };
            self.cooldown_until = now_ts() + cooldown;
        }
        Ok(())
    }

    // ───────────────────── passive attempt ─────────────────────

    /// Rest a reduce-only post-only order on the favorable side of mid and
    /// poll inventory for up to `passive_wait_seconds`. Success is reaching
    /// the trigger band or shedding at least 60% of the clip.
    async fn try_passive(
        &mut self,
        mid: Decimal,
        start_inventory: Decimal,
        clip: Decimal,
        side: Side,
    ) -> bool {
        let offset = Decimal::from_f64(self.cfg.passive_offset_bps / 10_000.0)
            .unwrap_or(Decimal::ZERO);
        let price = match side {
            Side::Ask => mid * (Decimal::ONE + offset),
            Side::Bid => mid * (Decimal::ONE - offset),
        };
        info!(
            "[hedger] passive {} {}@{} (clip={})",
            side.as_str(),
            self.market,
            price,
            clip
        );
        let placed = match self
            .exchange
            .create_post_only_limit(&self.market, side, price, clip, true)
            .await
        {
            Ok(placed) => placed,
            Err(err) => {
                warn!("[hedger] passive placement failed: {err}");
                return false;
            }
        };
        self.state.add_order(
            placed.client_order_id,
            OrderInfo {
                market: self.market.clone(),
                side,
                price,
                size: clip,
                placed_at: now_ts(),
            },
        );

        let deadline = now_ts() + self.cfg.passive_wait_seconds;
        let success_floor = clip * Decimal::from_f64(0.6).unwrap_or(Decimal::ONE);
        let mut succeeded = false;
        while now_ts() < deadline {
            sleep(Duration::from_secs_f64(
                (self.cfg.passive_wait_seconds / 4.0).clamp(0.02, 0.25),
            ))
            .await;
            let inv = self.state.get_inventory(&self.market);
            let shed = start_inventory.abs() - inv.abs();
            if inv.abs() <= self.cfg.trigger_units || shed >= success_floor {
                succeeded = true;
                break;
            }
        }

        // pull the resting order either way; any residual is stale
        if let Err(err) = self
            .exchange
            .cancel_order(&self.market, placed.client_order_id)
            .await
        {
            debug!("[hedger] passive cancel failed: {err}");
        }
        self.state.remove_order(placed.client_order_id);

        if succeeded {
            info!("[hedger] passive reduction succeeded");
        } else {
            info!("[hedger] passive timed out; escalating to aggressive");
        }
        succeeded
    }

    // ───────────────────── aggressive path ─────────────────────

    async fn aggressive(
        &mut self,
        mid: Decimal,
        clip: Decimal,
        side: Side,
        emergency: bool,
    ) -> bool {
        let mut offset_bps = self.cfg.price_offset_bps;
        if emergency {
            offset_bps += self.cfg.guard_emergency_extra_bps;
        }
        if offset_bps > self.cfg.max_slippage_bps {
            warn!(
                "[hedger] expected slippage {:.1}bps exceeds cap {:.1}bps; skipping",
                offset_bps, self.cfg.max_slippage_bps
            );
            return false;
        }
        let offset = Decimal::from_f64(offset_bps / 10_000.0).unwrap_or(Decimal::ZERO);
        // cross the spread in the reducing direction
        let price = match side {
            Side::Ask => mid * (Decimal::ONE - offset),
            Side::Bid => mid * (Decimal::ONE + offset),
        };

        for attempt in 1..=self.cfg.max_attempts.max(1) {
            info!(
                "[hedger] aggressive {} {}@{} clip={} attempt={}{}",
                side.as_str(),
                self.market,
                price,
                clip,
                attempt,
                if emergency { " [emergency]" } else { "" },
            );
            match self
                .exchange
                .create_limit_order(&self.market, side, price, clip, true, false, TimeInForce::Ioc)
                .await
            {
                Ok(_) => return true,
                Err(err) => {
                    warn!("[hedger] aggressive attempt {attempt} failed: {err}");
                    if attempt == self.cfg.max_attempts.max(1) {
                        fire_and_forget(
                            &self.alerts,
                            AlertLevel::Error,
                            "Hedge failed",
                            &err.to_string(),
                        );
                    } else {
                        sleep(Duration::from_secs_f64(
                            self.cfg.retry_backoff_seconds.max(0.0),
                        ))
                        .await;
                    }
                }
            }
        }
        false
    }

    // ───────────────────── dry-run path ─────────────────────

    /// Simulate the aggressive reduction: mutate inventory and journal a
    /// `hedger`-sourced fill so paper runs stay analyzable.
    fn simulate_reduction(
        &self,
        mid: Decimal,
        inventory: Decimal,
        clip: Decimal,
        side: Side,
        emergency: bool,
    ) -> bool {
        let mut offset_bps = self.cfg.price_offset_bps;
        if emergency {
            offset_bps += self.cfg.guard_emergency_extra_bps;
        }
        if offset_bps > self.cfg.max_slippage_bps {
            return false;
        }
        let offset = Decimal::from_f64(offset_bps / 10_000.0).unwrap_or(Decimal::ZERO);
        let price = match side {
            Side::Ask => mid * (Decimal::ONE - offset),
            Side::Bid => mid * (Decimal::ONE + offset),
        };
        let clip = clip.min(inventory.abs());
        let base_delta = if inventory > Decimal::ZERO { -clip } else { clip };
        let notional = clip * price;
        let fee = notional * self.taker_fee_rate;

        info!(
            "[hedger] [dry-run] {} {}@{} clip={}",
            side.as_str(),
            self.market,
            price,
            clip
        );
        self.state.update_inventory(&self.market, base_delta);
        self.ledger.append(&FillEvent {
            timestamp: now_ts(),
            market: self.market.clone(),
            role: Role::Taker,
            side,
            size: clip,
            price,
            notional,
            base_delta,
            quote_delta: -(base_delta * price),
            fee_paid: fee,
            mid_price: Some(mid),
            source: FillSource::Hedger,
            ..FillEvent::default()
        });
        true
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

    /// Records orders; IOC orders "fill" by moving state inventory toward
    /// zero by the order size, standing in for the venue + account channel.
    struct MockExchange {
        state: Arc<StateStore>,
        fill_ioc: bool,
        placed: Mutex<Vec<(PlacedOrder, bool, TimeInForce)>>,
        cancels: Mutex<Vec<u64>>,
        next_id: AtomicU64,
    }

    impl MockExchange {
        fn new(state: Arc<StateStore>, fill_ioc: bool) -> Arc<Self> {
            Arc::new(Self {
                state,
                fill_ioc,
                placed: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl OrderApi for MockExchange {
        async fn create_limit_order(
            &self,
            market: &str,
            side: Side,
            price: Decimal,
            size: Decimal,
            reduce_only: bool,
            _post_only: bool,
            tif: TimeInForce,
        ) -> Result<PlacedOrder> {
            let order = PlacedOrder {
                market: market.to_string(),
                side,
                price,
                size,
                client_order_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                tx_hash: None,
            };
            self.placed.lock().unwrap().push((order.clone(), reduce_only, tif));
            if tif == TimeInForce::Ioc && self.fill_ioc {
                let delta = match side {
                    Side::Ask => -size,
                    Side::Bid => size,
                };
                self.state.update_inventory(market, delta);
            }
            Ok(order)
        }

        async fn cancel_order(&self, _market: &str, client_order_id: u64) -> Result<()> {
            self.cancels.lock().unwrap().push(client_order_id);
            Ok(())
        }
    }

    fn cfg() -> HedgerConfig {
        HedgerConfig {
            enabled: true,
            market: None,
            trigger_units: dec!(0.05),
            trigger_notional: None,
            target_units: Decimal::ZERO,
            max_clip_units: dec!(0.05),
            price_offset_bps: 6.0,
            passive_offset_bps: 2.0,
            prefer_passive: true,
            passive_wait_seconds: 0.1,
            passive_timeout_seconds: 5.0,
            poll_interval_seconds: 1.5,
            cooldown_seconds: 10.0,
            max_slippage_bps: 15.0,
            max_attempts: 2,
            retry_backoff_seconds: 0.0,
            guard_emergency_seconds: 30.0,
            guard_emergency_clip_multiplier: 1.5,
            guard_emergency_extra_bps: 4.0,
            guard_clip_multiplier: 0.5,
            dry_run: Some(false),
        }
    }

    struct Fixture {
        hedger: Hedger,
        state: Arc<StateStore>,
        exchange: Arc<MockExchange>,
        ledger: Arc<MetricsLedger>,
        _dir: tempfile::TempDir,
    }

    fn fixture(cfg: HedgerConfig, dry_run: bool, fill_ioc: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(StateStore::new());
        let exchange = MockExchange::new(state.clone(), fill_ioc);
        let ledger = Arc::new(MetricsLedger::new(dir.path().join("fills.jsonl"), None, None));
        let (_fill_tx, fills_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let hedger = Hedger::new(
            cfg,
            "market:2",
            dry_run,
            Decimal::ZERO,
            state.clone(),
            exchange.clone(),
            ledger.clone(),
            Telemetry::new(false, 0),
            AlertSink::new(None, false, "test"),
            fills_rx,
            shutdown_rx,
        );
        Fixture { hedger, state, exchange, ledger, _dir: dir }
    }

    #[tokio::test]
    async fn test_within_trigger_is_a_noop() {
        let mut fx = fixture(cfg(), false, true);
        fx.state.set_mid("market:2", dec!(100));
        fx.state.set_inventory("market:2", dec!(0.04));
        fx.hedger.evaluate().await.unwrap();
        assert!(fx.exchange.placed.lock().unwrap().is_empty());
        assert!(fx.hedger.over_trigger_since.is_none());
    }

    #[tokio::test]
    async fn test_passive_then_aggressive_escalation() {
        let mut fx = fixture(cfg(), false, true);
        fx.state.set_mid("market:2", dec!(100));
        fx.state.set_inventory("market:2", dec!(0.06));

        fx.hedger.evaluate().await.unwrap();

        let placed = fx.exchange.placed.lock().unwrap();
        assert_eq!(placed.len(), 2);

        // passive first: reduce-only post-only ask above mid
        let (passive, reduce_only, tif) = &placed[0];
        assert_eq!(passive.side, Side::Ask);
        assert!(*reduce_only);
        assert_eq!(*tif, TimeInForce::PostOnly);
        assert_eq!(passive.price, dec!(100.02)); // 100 * (1 + 2bps)
        assert_eq!(passive.size, dec!(0.05));

        // then aggressive IOC crossing down
        let (ioc, reduce_only, tif) = &placed[1];
        assert_eq!(*tif, TimeInForce::Ioc);
        assert!(*reduce_only);
        assert_eq!(ioc.price, dec!(99.94)); // 100 * (1 - 6bps)
        assert_eq!(ioc.size, dec!(0.05));

        // passive order was cancelled on timeout
        assert_eq!(fx.exchange.cancels.lock().unwrap().len(), 1);
        drop(placed);

        // the IOC "filled": inventory is back inside the trigger band
        assert_eq!(fx.state.get_inventory("market:2"), dec!(0.01));

        // next wakeup clears the over-trigger marker without new orders
        fx.hedger.evaluate().await.unwrap();
        assert!(fx.hedger.over_trigger_since.is_none());
        assert_eq!(fx.exchange.placed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_passive_success_skips_aggressive() {
        let mut fx = fixture(cfg(), false, true);
        fx.state.set_mid("market:2", dec!(100));
        fx.state.set_inventory("market:2", dec!(0.06));

        // simulate the passive fill landing while the hedger waits
        let state = fx.state.clone();
        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            state.set_inventory("market:2", dec!(0.01));
        });

        fx.hedger.evaluate().await.unwrap();
        handle.await.unwrap();

        let placed = fx.exchange.placed.lock().unwrap();
        assert_eq!(placed.len(), 1, "no aggressive order after passive success");
        assert_eq!(placed[0].2, TimeInForce::PostOnly);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_hedges() {
        let mut fx = fixture(HedgerConfig { prefer_passive: false, ..cfg() }, false, false);
        fx.state.set_mid("market:2", dec!(100));
        fx.state.set_inventory("market:2", dec!(0.2));

        fx.hedger.evaluate().await.unwrap();
        assert_eq!(fx.exchange.placed.lock().unwrap().len(), 1);

        // still over trigger (mock does not fill), but cooldown holds
        fx.hedger.evaluate().await.unwrap();
        assert_eq!(fx.exchange.placed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notional_trigger_both_rule() {
        let mut fx = fixture(
            HedgerConfig { trigger_notional: Some(dec!(10)), prefer_passive: false, ..cfg() },
            false,
            true,
        );
        fx.state.set_mid("market:2", dec!(100));
        // over units (0.06 > 0.05) but notional 6 <= 10 → no hedge
        fx.state.set_inventory("market:2", dec!(0.06));
        fx.hedger.evaluate().await.unwrap();
        assert!(fx.exchange.placed.lock().unwrap().is_empty());

        // both exceeded → hedge
        fx.state.set_inventory("market:2", dec!(0.2));
        fx.hedger.evaluate().await.unwrap();
        assert_eq!(fx.exchange.placed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slippage_cap_skips_aggressive() {
        let mut fx = fixture(
            HedgerConfig {
                prefer_passive: false,
                price_offset_bps: 20.0,
                max_slippage_bps: 15.0,
                ..cfg()
            },
            false,
            true,
        );
        fx.state.set_mid("market:2", dec!(100));
        fx.state.set_inventory("market:2", dec!(0.2));
        fx.hedger.evaluate().await.unwrap();
        assert!(fx.exchange.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_escalation_on_persistent_guard_block() {
        let mut fx = fixture(HedgerConfig { prefer_passive: true, ..cfg() }, false, true);
        fx.state.set_mid("market:2", dec!(100));
        fx.state.set_inventory("market:2", dec!(0.2));
        // guard blocked for longer than guard_emergency_seconds
        fx.state.mark_guard_blocked("market:2", now_ts() - 100.0);
        // a pending cooldown is overridden by the emergency
        fx.hedger.cooldown_until = now_ts() + 100.0;

        fx.hedger.evaluate().await.unwrap();

        let placed = fx.exchange.placed.lock().unwrap();
        assert_eq!(placed.len(), 1, "emergency goes straight to aggressive");
        let (order, _, tif) = &placed[0];
        assert_eq!(*tif, TimeInForce::Ioc);
        // clip 0.05 * 1.5 emergency multiplier
        assert_eq!(order.size, dec!(0.075));
        // offset 6 + 4 extra = 10bps below mid
        assert_eq!(order.price, dec!(99.90));
    }

    #[tokio::test]
    async fn test_short_inventory_hedges_with_bid() {
        let mut fx = fixture(HedgerConfig { prefer_passive: false, ..cfg() }, false, true);
        fx.state.set_mid("market:2", dec!(100));
        fx.state.set_inventory("market:2", dec!(-0.2));
        fx.hedger.evaluate().await.unwrap();
        let placed = fx.exchange.placed.lock().unwrap();
        assert_eq!(placed[0].0.side, Side::Bid);
        // buying back crosses upward
        assert_eq!(placed[0].0.price, dec!(100.06));
    }

    #[tokio::test]
    async fn test_pnl_guard_shrinks_clip() {
        let mut fx = fixture(HedgerConfig { prefer_passive: false, ..cfg() }, false, true);
        fx.state.set_mid("market:2", dec!(100));
        fx.state.set_inventory("market:2", dec!(0.2));
        fx.state.set_flag("pnl_guard_active", true);
        fx.hedger.evaluate().await.unwrap();
        // clip 0.05 * guard_clip_multiplier 0.5
        assert_eq!(fx.exchange.placed.lock().unwrap()[0].0.size, dec!(0.025));
    }

    #[tokio::test]
    async fn test_dry_run_simulates_fill_and_journals() {
        let mut fx = fixture(cfg(), true, false);
        fx.state.set_mid("market:2", dec!(100));
        fx.state.set_inventory("market:2", dec!(0.06));

        fx.hedger.evaluate().await.unwrap();

        // no exchange traffic at all
        assert!(fx.exchange.placed.lock().unwrap().is_empty());
        // inventory reduced by the clip
        assert_eq!(fx.state.get_inventory("market:2"), dec!(0.01));
        let events = fx.ledger.iter_events(None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, FillSource::Hedger);
        assert_eq!(events[0].role, Role::Taker);
        assert_eq!(events[0].base_delta, dec!(-0.05));
    }
}
