//! Quote admission guard.
//!
//! Stateless predicate over a candidate (bid, ask) pair: crossed book,
//! price band around mid, and per-market inventory caps (units and
//! notional). A single failing rule denies the pair; the caller cancels
//! outstanding orders, marks the market guard-blocked and backs off.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::GuardConfig;
use crate::state::StateStore;

pub struct SafetyGuard {
    state: Arc<StateStore>,
    cfg: GuardConfig,
}

impl SafetyGuard {
    pub fn new(state: Arc<StateStore>, cfg: GuardConfig) -> Self {
        Self { state, cfg }
    }

    /// True when the pair may be quoted on `market`.
    pub fn is_allowed(&self, mid: Decimal, bid: Decimal, ask: Decimal, market: &str) -> bool {
        if !self.check_crossed_book(bid, ask) {
            return false;
        }
        if !self.check_price_band(mid, bid, ask) {
            return false;
        }
        // Notional cap prefers the market's own mid over the caller's.
        let ref_mid = self.state.get_mid(market).unwrap_or(mid);
        if !self.check_inventory(market, ref_mid) {
            return false;
        }
        true
    }

    fn check_crossed_book(&self, bid: Decimal, ask: Decimal) -> bool {
        if !self.cfg.crossed_book_protection {
            return true;
        }
        if bid >= ask {
            warn!("[guard] crossed book detected (bid {bid} >= ask {ask})");
            if self.cfg.kill_on_crossed_book {
                error!("[guard] kill-switch: crossed-book state");
            }
            return false;
        }
        true
    }

    fn check_price_band(&self, mid: Decimal, bid: Decimal, ask: Decimal) -> bool {
        let band = self.cfg.price_band_bps / Decimal::from(10_000);
        let lower = mid * (Decimal::ONE - band);
        let upper = mid * (Decimal::ONE + band);
        if bid < lower || ask > upper {
            info!(
                "[guard] quote outside price band ±{}bps: bid={} ask={} mid={}",
                self.cfg.price_band_bps, bid, ask, mid
            );
            return false;
        }
        true
    }

    fn check_inventory(&self, market: &str, ref_mid: Decimal) -> bool {
        let inv = self.state.get_inventory(market);
        let notional = inv.abs() * ref_mid;
        if inv.abs() > self.cfg.max_position_units || notional > self.cfg.max_inventory_notional {
            warn!(
                "[guard] inventory breach mkt={}: inv={} notional={} limits=({} units, {} notional)",
                market, inv, notional, self.cfg.max_position_units, self.cfg.max_inventory_notional
            );
            if self.cfg.kill_on_inventory_breach {
                error!("[guard] kill-switch: inventory exceeded");
            }
            return false;
        }
        true
    }
}
