//! EMA volatility gauge with pause hysteresis.
//!
//! Statistical, not monetary: everything here is f64 bps. The EMA is
//! initialized lazily on the first mid and updated multiplicatively with a
//! halflife-derived alpha. Two pause conditions gate quoting: sustained
//! high volatility (resume requires calm EMA *and* reduced inventory) and
//! dead-quiet markets (resume on EMA recovery).

use crate::config::VolatilityConfig;

#[derive(Debug)]
pub struct VolatilityTracker {
    cfg: VolatilityConfig,
    ema_bps: f64,
    last_mid: Option<f64>,
    last_ts: f64,
    paused_high: bool,
    paused_low: bool,
}

impl VolatilityTracker {
    pub fn new(cfg: VolatilityConfig) -> Self {
        Self { cfg, ema_bps: 0.0, last_mid: None, last_ts: 0.0, paused_high: false, paused_low: false }
    }

    pub fn ema_bps(&self) -> f64 {
        self.ema_bps
    }

    /// Feed one mid observation; returns the updated EMA in bps.
    pub fn update(&mut self, mid: f64, now: f64) -> f64 {
        if !self.cfg.enabled {
            return self.ema_bps;
        }
        let Some(last_mid) = self.last_mid else {
            self.last_mid = Some(mid);
            self.last_ts = now;
            self.ema_bps = 0.0;
            return 0.0;
        };
        let dt = (now - self.last_ts).max(1e-6);
        let change_bps = ((mid - last_mid).abs() / last_mid.max(1e-9)) * 10_000.0;
        let halflife = self.cfg.ema_halflife_seconds.max(1.0);
        let alpha = 1.0 - (-(std::f64::consts::LN_2) * dt / halflife).exp();
        self.ema_bps += alpha * (change_bps - self.ema_bps);
        self.last_mid = Some(mid);
        self.last_ts = now;
        self.ema_bps
    }

    /// Refresh the two pause latches. `inventory_ratio` is |inv|/soft_cap;
    /// high-vol resume additionally requires it under the configured ratio.
    pub fn update_pause_flags(&mut self, inventory_ratio: f64) {
        if !self.cfg.enabled {
            self.paused_high = false;
            self.paused_low = false;
            return;
        }

        let high_pause = self.cfg.high_vol_pause_threshold_bps;
        if high_pause > 0.0 {
            if self.ema_bps >= high_pause {
                self.paused_high = true;
            } else if self.paused_high
                && self.ema_bps <= self.cfg.high_vol_resume_threshold_bps
                && inventory_ratio <= self.cfg.resume_inventory_ratio
            {
                self.paused_high = false;
            }
        }

        let low_pause = self.cfg.low_vol_pause_threshold_bps;
        if low_pause > 0.0 {
            if self.ema_bps > 0.0 && self.ema_bps <= low_pause {
                self.paused_low = true;
            } else if self.paused_low
                && self.cfg.low_vol_resume_threshold_bps > 0.0
                && self.ema_bps >= self.cfg.low_vol_resume_threshold_bps
            {
                self.paused_low = false;
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_high || self.paused_low
    }

    /// Map the EMA onto [min_spread, max_spread] (piecewise-linear over
    /// [low_bps, high_bps]). Disabled → the caller's base spread.
    pub fn spread_for_volatility(&self, base_spread_bps: f64) -> f64 {
        if !self.cfg.enabled {
            return base_spread_bps;
        }
        let mut factor = 0.0;
        if self.cfg.high_bps > self.cfg.low_bps {
            factor = (self.ema_bps - self.cfg.low_bps) / (self.cfg.high_bps - self.cfg.low_bps);
            factor = factor.clamp(0.0, 1.0);
        }
        self.cfg.min_spread_bps + (self.cfg.max_spread_bps - self.cfg.min_spread_bps) * factor
    }

    /// Size multiplier: 1.0 at/below low_bps, `size_factor_min` at/above
    /// high_bps.
    pub fn size_factor(&self) -> f64 {
        if !self.cfg.enabled || self.cfg.size_factor_min >= 1.0 {
            return 1.0;
        }
        let mut factor = 0.0;
        if self.cfg.high_bps > self.cfg.low_bps {
            factor = (self.ema_bps - self.cfg.low_bps) / (self.cfg.high_bps - self.cfg.low_bps);
            factor = factor.clamp(0.0, 1.0);
        }
        1.0 - (1.0 - self.cfg.size_factor_min) * factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> VolatilityConfig {
        VolatilityConfig {
            enabled: true,
            low_bps: 5.0,
            high_bps: 25.0,
            min_spread_bps: 10.0,
            max_spread_bps: 20.0,
            high_vol_pause_threshold_bps: 30.0,
            high_vol_resume_threshold_bps: 15.0,
            low_vol_pause_threshold_bps: 1.0,
            low_vol_resume_threshold_bps: 2.0,
            resume_inventory_ratio: 0.25,
            ema_halflife_seconds: 30.0,
            size_factor_min: 0.5,
        }
    }

    #[test]
    fn test_first_sample_initializes_without_signal() {
        let mut vol = VolatilityTracker::new(cfg());
        assert_eq!(vol.update(100.0, 0.0), 0.0);
        assert_eq!(vol.ema_bps(), 0.0);
    }

    #[test]
    fn test_ema_rises_with_movement_and_decays_when_quiet() {
        let mut vol = VolatilityTracker::new(cfg());
        vol.update(100.0, 0.0);
        // 1% move = 100bps
        let after_move = vol.update(101.0, 30.0);
        assert!(after_move > 10.0, "expected a strong ema response, got {after_move}");
        // flat mids decay the ema
        let mut ema = after_move;
        for i in 1..=10 {
            ema = vol.update(101.0, 30.0 + 30.0 * i as f64);
        }
        assert!(ema < after_move / 2.0);
    }

    #[test]
    fn test_spread_mapping_bounds() {
        let mut vol = VolatilityTracker::new(cfg());
        vol.ema_bps = 0.0;
        assert_eq!(vol.spread_for_volatility(10.0), 10.0);
        vol.ema_bps = 25.0;
        assert_eq!(vol.spread_for_volatility(10.0), 20.0);
        vol.ema_bps = 15.0;
        assert_eq!(vol.spread_for_volatility(10.0), 15.0);
        vol.ema_bps = 100.0;
        assert_eq!(vol.spread_for_volatility(10.0), 20.0);
    }

    #[test]
    fn test_high_vol_pause_requires_calm_and_flat_inventory_to_resume() {
        let mut vol = VolatilityTracker::new(cfg());
        vol.ema_bps = 35.0;
        vol.update_pause_flags(0.0);
        assert!(vol.is_paused());

        // calm again but inventory still heavy → stay paused
        vol.ema_bps = 10.0;
        vol.update_pause_flags(0.9);
        assert!(vol.is_paused());

        vol.update_pause_flags(0.1);
        assert!(!vol.is_paused());
    }

    #[test]
    fn test_low_vol_pause_and_resume() {
        let mut vol = VolatilityTracker::new(cfg());
        vol.ema_bps = 0.5;
        vol.update_pause_flags(0.0);
        assert!(vol.is_paused());
        vol.ema_bps = 3.0;
        vol.update_pause_flags(0.0);
        assert!(!vol.is_paused());
    }

    #[test]
    fn test_size_factor_interpolates() {
        let mut vol = VolatilityTracker::new(cfg());
        vol.ema_bps = 5.0;
        assert_eq!(vol.size_factor(), 1.0);
        vol.ema_bps = 25.0;
        assert_eq!(vol.size_factor(), 0.5);
        vol.ema_bps = 15.0;
        assert!((vol.size_factor() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_tracker_is_inert() {
        let mut vol = VolatilityTracker::new(VolatilityConfig { enabled: false, ..cfg() });
        vol.update(100.0, 0.0);
        vol.update(150.0, 1.0);
        assert_eq!(vol.ema_bps(), 0.0);
        vol.update_pause_flags(0.0);
        assert!(!vol.is_paused());
        assert_eq!(vol.spread_for_volatility(12.0), 12.0);
    }
}
