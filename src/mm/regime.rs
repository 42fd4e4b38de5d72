//! Aggressive/defensive regime switching.
//!
//! Votes for the defensive profile: active PnL guard, down trend signal,
//! downtrend cooldown, or low volatility. A switch only commits after the
//! minimum dwell time since the last one.

use tracing::info;

use crate::config::{RegimeConfig, RegimeProfileConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Aggressive,
    Defensive,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Aggressive => "aggressive",
            Regime::Defensive => "defensive",
        }
    }
}

#[derive(Debug)]
pub struct RegimeSwitcher {
    cfg: RegimeConfig,
    current: Regime,
    last_switch_ts: f64,
}

impl RegimeSwitcher {
    pub fn new(cfg: RegimeConfig) -> Self {
        Self { cfg, current: Regime::Aggressive, last_switch_ts: 0.0 }
    }

    pub fn current(&self) -> Regime {
        self.current
    }

    /// Re-evaluate and, dwell permitting, commit a regime switch.
    pub fn choose(
        &mut self,
        pnl_guard_active: bool,
        trend_down: bool,
        cooldown_active: bool,
        ema_bps: f64,
        now: f64,
    ) -> Regime {
        if !self.cfg.enabled {
            return self.current;
        }
        let low_vol = self.cfg.vol_threshold_bps > 0.0 && ema_bps < self.cfg.vol_threshold_bps;
        let target = if pnl_guard_active || trend_down || cooldown_active || low_vol {
            Regime::Defensive
        } else {
            Regime::Aggressive
        };
        if target != self.current && now - self.last_switch_ts >= self.cfg.min_dwell_seconds {
            info!("[regime] {} -> {}", self.current.as_str(), target.as_str());
            self.current = target;
            self.last_switch_ts = now;
        }
        self.current
    }

    pub fn profile(&self) -> &RegimeProfileConfig {
        match self.current {
            Regime::Aggressive => &self.cfg.aggressive,
            Regime::Defensive => &self.cfg.defensive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RegimeConfig {
        RegimeConfig { enabled: true, min_dwell_seconds: 60.0, ..RegimeConfig::default() }
    }

    #[test]
    fn test_switches_to_defensive_on_any_vote() {
        for vote in 0..4 {
            let mut switcher = RegimeSwitcher::new(cfg());
            let regime = switcher.choose(
                vote == 0,
                vote == 1,
                vote == 2,
                if vote == 3 { 1.0 } else { 10.0 },
                100.0,
            );
            assert_eq!(regime, Regime::Defensive, "vote {vote}");
        }
    }

    #[test]
    fn test_dwell_blocks_early_flapping() {
        let mut switcher = RegimeSwitcher::new(cfg());
        assert_eq!(switcher.choose(true, false, false, 10.0, 100.0), Regime::Defensive);
        // calm again 10s later, dwell not met → stays defensive
        assert_eq!(switcher.choose(false, false, false, 10.0, 110.0), Regime::Defensive);
        // dwell met → back to aggressive
        assert_eq!(switcher.choose(false, false, false, 10.0, 161.0), Regime::Aggressive);
    }

    #[test]
    fn test_profiles_follow_regime() {
        let mut switcher = RegimeSwitcher::new(cfg());
        assert_eq!(switcher.profile().size_multiplier, 1.0);
        switcher.choose(true, false, false, 10.0, 100.0);
        assert_eq!(switcher.profile().size_multiplier, 0.7);
    }

    #[test]
    fn test_disabled_switcher_stays_aggressive() {
        let mut switcher = RegimeSwitcher::new(RegimeConfig { enabled: false, ..cfg() });
        assert_eq!(switcher.choose(true, true, true, 0.0, 100.0), Regime::Aggressive);
    }
}
