//! Reactive PnL guard.
//!
//! Watches the FIFO realized counter; when it sits below the configured
//! floor for enough consecutive checks, quoting widens and shrinks until
//! the cooldown expires.

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::PnlGuardConfig;

#[derive(Debug)]
pub struct PnlGuard {
    cfg: PnlGuardConfig,
    active: bool,
    spread_extra_bps: f64,
    size_mult: f64,
    expires_at: f64,
    consecutive_triggers: u32,
    last_check_ts: f64,
}

impl PnlGuard {
    pub fn new(cfg: PnlGuardConfig) -> Self {
        Self {
            cfg,
            active: false,
            spread_extra_bps: 0.0,
            size_mult: 1.0,
            expires_at: 0.0,
            consecutive_triggers: 0,
            last_check_ts: 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.cfg.enabled && self.active
    }

    pub fn spread_adjustment_bps(&self) -> f64 {
        if self.is_active() {
            self.spread_extra_bps
        } else {
            0.0
        }
    }

    pub fn size_multiplier(&self) -> f64 {
        if self.is_active() {
            self.size_mult
        } else {
            1.0
        }
    }

    /// Feed the current FIFO realized value. Throttled internally to the
    /// configured check interval; expiry is evaluated on every call.
    pub fn check_and_update(&mut self, realized_quote: Decimal, now: f64) {
        if !self.cfg.enabled {
            return;
        }

        if self.active && now >= self.expires_at {
            info!("[pnl_guard] cooldown expired, deactivating");
            self.deactivate();
        }

        if now - self.last_check_ts < self.cfg.check_interval_seconds {
            return;
        }
        self.last_check_ts = now;

        if realized_quote < self.cfg.realized_floor_quote {
            self.consecutive_triggers += 1;
            if self.consecutive_triggers >= self.cfg.trigger_consecutive && !self.active {
                warn!(
                    "[pnl_guard] triggered: realized={} < floor={}",
                    realized_quote, self.cfg.realized_floor_quote
                );
                self.activate(now);
            }
        } else if self.consecutive_triggers > 0 {
            self.consecutive_triggers = 0;
            info!("[pnl_guard] realized above floor, resetting triggers");
        }
    }

    fn activate(&mut self, now: f64) {
        self.active = true;
        self.spread_extra_bps = self.cfg.widen_bps.min(self.cfg.max_extra_bps);
        self.size_mult = self.cfg.size_multiplier.max(self.cfg.min_size_multiplier);
        self.expires_at = now + self.cfg.cooldown_seconds;
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.spread_extra_bps = 0.0;
        self.size_mult = 1.0;
        self.consecutive_triggers = 0;
    }
}
