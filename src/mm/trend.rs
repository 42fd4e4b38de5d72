//! Trend filter over a bounded mid-price lookback.
//!
//! Three-valued state machine (neutral / ask_only / bid_only) with
//! hysteresis on exit, a downtrend cooldown, and an inventory-aware
//! override: the quoting bias never locks us out of the side we need to
//! close a heavy position.

use std::collections::VecDeque;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::info;

use crate::config::TrendConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Both,
    Ask,
    Bid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrendState {
    Neutral,
    AskOnly,
    BidOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrendSignal {
    Neutral,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendDecision {
    pub bias: Bias,
    pub extra_spread_bps: f64,
}

#[derive(Debug)]
pub struct TrendFilter {
    cfg: TrendConfig,
    samples: VecDeque<(f64, f64)>,
    state: TrendState,
    signal: TrendSignal,
    cooldown_until: f64,
}

impl TrendFilter {
    pub fn new(cfg: TrendConfig) -> Self {
        Self {
            cfg,
            samples: VecDeque::new(),
            state: TrendState::Neutral,
            signal: TrendSignal::Neutral,
            cooldown_until: 0.0,
        }
    }

    /// Append a mid sample and trim the lookback window.
    pub fn update(&mut self, mid: f64, now: f64) {
        if !self.cfg.enabled {
            return;
        }
        self.samples.push_back((now, mid));
        while let Some(&(ts, _)) = self.samples.front() {
            if now - ts > self.cfg.lookback_seconds {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn signal_down(&self) -> bool {
        self.signal == TrendSignal::Down
    }

    pub fn cooldown_active(&self, now: f64) -> bool {
        self.cfg.enabled && self.cfg.down_cooldown_seconds > 0.0 && now < self.cooldown_until
    }

    /// Regime overlays override the cooldown length per profile.
    pub fn set_down_cooldown_seconds(&mut self, seconds: f64) {
        self.cfg.down_cooldown_seconds = seconds;
    }

    /// Advance the state machine and produce the quoting bias for this tick.
    pub fn decide(
        &mut self,
        current_mid: f64,
        inventory: Decimal,
        inventory_soft_cap: Decimal,
        now: f64,
    ) -> TrendDecision {
        if !self.cfg.enabled {
            return TrendDecision { bias: Bias::Both, extra_spread_bps: 0.0 };
        }
        if self.samples.len() < 2 {
            self.state = TrendState::Neutral;
            return TrendDecision { bias: Bias::Both, extra_spread_bps: 0.0 };
        }

        let Some(&(_, oldest_mid)) = self.samples.front() else {
            return TrendDecision { bias: Bias::Both, extra_spread_bps: 0.0 };
        };
        let delta_bps = ((current_mid - oldest_mid) / oldest_mid.max(1e-9)) * 10_000.0;

        let previous = self.state;
        let hysteresis = self.cfg.resume_threshold_bps;

        // exiting a directional state is harder than entering it
        match self.state {
            TrendState::AskOnly if delta_bps < hysteresis => self.state = TrendState::Neutral,
            TrendState::BidOnly if delta_bps > -hysteresis => self.state = TrendState::Neutral,
            _ => {}
        }

        match self.state {
            TrendState::Neutral => {
                if delta_bps >= self.cfg.threshold_bps {
                    self.state = TrendState::AskOnly;
                    self.signal = TrendSignal::Up;
                } else if delta_bps <= -self.cfg.down_threshold_bps {
                    self.state = if self.cfg.down_bias == "bid" {
                        TrendState::BidOnly
                    } else {
                        TrendState::AskOnly
                    };
                    self.signal = TrendSignal::Down;
                    if self.cfg.down_cooldown_seconds > 0.0 {
                        self.cooldown_until = self
                            .cooldown_until
                            .max(now + self.cfg.down_cooldown_seconds);
                    }
                } else {
                    self.signal = TrendSignal::Neutral;
                }
            }
            TrendState::AskOnly if self.signal == TrendSignal::Down => {
                if delta_bps > -hysteresis {
                    self.signal = TrendSignal::Neutral;
                }
            }
            TrendState::BidOnly if self.signal == TrendSignal::Up => {
                if delta_bps < hysteresis {
                    self.signal = TrendSignal::Neutral;
                }
            }
            _ => {}
        }
        if self.state == TrendState::Neutral {
            self.signal = TrendSignal::Neutral;
        }

        if previous != self.state {
            info!("[trend] state -> {:?} (delta={:.2}bps)", self.state, delta_bps);
        }

        let cooldown_active = self.cooldown_active(now);
        let ratio = Decimal::from_f64(self.cfg.inventory_soft_cap_ratio).unwrap_or(Decimal::ONE);
        let inv_limit = (inventory_soft_cap * ratio).max(Decimal::new(1, 9));
        let inv_abs = inventory.abs();

        let mut bias = Bias::Both;
        let mut extra_spread = 0.0;

        match self.state {
            TrendState::AskOnly => {
                // uptrend prefers selling, but a heavy short must be allowed to buy back
                if inv_abs > inv_limit && inventory < Decimal::ZERO {
                    bias = Bias::Both;
                } else {
                    bias = Bias::Ask;
                    extra_spread = if self.signal != TrendSignal::Down {
                        self.cfg.extra_spread_bps
                    } else {
                        self.cfg.down_extra_spread_bps
                    };
                }
            }
            TrendState::BidOnly => {
                if inv_abs > inv_limit && inventory > Decimal::ZERO {
                    bias = Bias::Both;
                } else {
                    bias = Bias::Bid;
                    extra_spread = self.cfg.extra_spread_bps;
                }
            }
            TrendState::Neutral => {}
        }

        if cooldown_active && bias != Bias::Both {
            bias = Bias::Ask;
            extra_spread = extra_spread.max(self.cfg.down_extra_spread_bps);
        }

        TrendDecision { bias, extra_spread_bps: extra_spread }
    }
}
