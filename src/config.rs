//! Nested configuration tree.
//!
//! Every section and field is defaulted, so a missing file, a missing
//! section or a missing key never aborts startup: the documented default
//! is substituted and a one-time warning is logged. Environment only
//! chooses the file path (`BOT_CONFIG`, default `config.json`).

use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ─────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub api: ApiConfig,
    pub ws: WsConfig,
    pub capture: CaptureConfig,
    pub synthetic: SyntheticConfig,
    pub maker: MakerConfig,
    pub hedger: HedgerConfig,
    pub fees: FeesConfig,
    pub guard: GuardConfig,
    pub alerts: AlertsConfig,
    pub telemetry: TelemetryConfig,
    pub watchdogs: WatchdogConfig,
    pub ledger: LedgerConfig,
}

impl Config {
    /// Load from the path in `BOT_CONFIG` (default `config.json`).
    pub fn load_from_env() -> Self {
        let path = std::env::var("BOT_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        Self::load(&path)
    }

    pub fn load(path: &str) -> Self {
        if !Path::new(path).exists() {
            warn!("config file {} not found; using defaults", path);
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("config file {} unparseable ({}); using defaults", path, err);
                    Self::default()
                }
            },
            Err(err) => {
                warn!("config file {} unreadable ({}); using defaults", path, err);
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { name: "zkperp-mm".to_string() }
    }
}

// ─────────────────────────────────────────────────────────
// Exchange API + market-data WS
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub account_index: i64,
    pub api_key_index: u32,
    /// Hex-encoded signing key. Absent means dry-run order routing.
    pub private_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mainnet.example-zkperp.exchange".to_string(),
            account_index: 0,
            api_key_index: 0,
            private_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub url: Option<String>,
    pub auth_token: Option<String>,
    /// Extra channels beyond the derived defaults.
    pub channels: Vec<String>,
    /// Consecutive connect failures before synthetic fallback.
    pub max_failures: u32,
    pub fallback_on_fail: bool,
    /// Throttle for mid-update info logs, seconds.
    pub log_mid_interval_s: f64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_token: None,
            channels: Vec::new(),
            max_failures: 3,
            fallback_on_fail: true,
            log_mid_interval_s: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub write_raw: bool,
    pub raw_path: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { write_raw: false, raw_path: "logs/ws_raw.jsonl".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub market: String,
    pub mid_start: f64,
    pub tick_step: f64,
    pub tick_jitter: f64,
    pub interval_seconds: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            market: "market:1".to_string(),
            mid_start: 107_000.0,
            tick_step: 5.0,
            tick_jitter: 2.0,
            interval_seconds: 1.0,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Maker
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MakerConfig {
    pub pair: String,
    /// Base quote size in base units.
    pub size: Decimal,
    pub size_min: Decimal,
    pub size_max: Decimal,
    pub spread_bps: f64,
    pub refresh_seconds: f64,
    pub randomize_bps: f64,
    /// Integer scaling factors at the exchange boundary.
    pub size_scale: u64,
    pub price_scale: u64,
    pub inventory_soft_cap: Decimal,
    pub exchange_min_size: Decimal,
    pub exchange_min_notional: Decimal,
    pub limits: MakerLimits,
    pub volatility: VolatilityConfig,
    pub trend: TrendConfig,
    pub regimes: RegimeConfig,
    pub pnl_guard: PnlGuardConfig,
    pub inventory: InventoryConfig,
}

impl Default for MakerConfig {
    fn default() -> Self {
        Self {
            pair: "market:1".to_string(),
            size: dec!(0.001),
            size_min: dec!(0.0005),
            size_max: dec!(0.002),
            spread_bps: 10.0,
            refresh_seconds: 5.0,
            randomize_bps: 4.0,
            size_scale: 1_000_000,
            price_scale: 100,
            inventory_soft_cap: dec!(0.05),
            exchange_min_size: dec!(0.0001),
            exchange_min_notional: Decimal::ZERO,
            limits: MakerLimits::default(),
            volatility: VolatilityConfig::default(),
            trend: TrendConfig::default(),
            regimes: RegimeConfig::default(),
            pnl_guard: PnlGuardConfig::default(),
            inventory: InventoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MakerLimits {
    /// Cancel budget per rolling 60s window.
    pub max_cancels: u32,
    pub max_latency_ms: u64,
}

impl Default for MakerLimits {
    fn default() -> Self {
        Self { max_cancels: 30, max_latency_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityConfig {
    pub enabled: bool,
    /// EMA range mapped onto [min_spread, max_spread].
    pub low_bps: f64,
    pub high_bps: f64,
    pub min_spread_bps: f64,
    pub max_spread_bps: f64,
    pub high_vol_pause_threshold_bps: f64,
    pub high_vol_resume_threshold_bps: f64,
    pub low_vol_pause_threshold_bps: f64,
    pub low_vol_resume_threshold_bps: f64,
    /// High-vol resume also requires |inv| <= soft_cap * this ratio.
    pub resume_inventory_ratio: f64,
    pub ema_halflife_seconds: f64,
    /// Size factor at high_bps; 1.0 disables vol-based size scaling.
    pub size_factor_min: f64,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            low_bps: 5.0,
            high_bps: 25.0,
            min_spread_bps: 10.0,
            max_spread_bps: 20.0,
            high_vol_pause_threshold_bps: 0.0,
            high_vol_resume_threshold_bps: 0.0,
            low_vol_pause_threshold_bps: 0.0,
            low_vol_resume_threshold_bps: 0.0,
            resume_inventory_ratio: 0.25,
            ema_halflife_seconds: 30.0,
            size_factor_min: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    pub enabled: bool,
    pub lookback_seconds: f64,
    pub threshold_bps: f64,
    pub down_threshold_bps: f64,
    pub resume_threshold_bps: f64,
    pub extra_spread_bps: f64,
    pub down_extra_spread_bps: f64,
    /// Which side survives a downtrend: "ask" or "bid".
    pub down_bias: String,
    pub down_cooldown_seconds: f64,
    pub inventory_soft_cap_ratio: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lookback_seconds: 45.0,
            threshold_bps: 12.0,
            down_threshold_bps: 4.0,
            resume_threshold_bps: 6.0,
            extra_spread_bps: 2.5,
            down_extra_spread_bps: 8.0,
            down_bias: "ask".to_string(),
            down_cooldown_seconds: 60.0,
            inventory_soft_cap_ratio: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeProfileConfig {
    pub size_multiplier: f64,
    pub extra_spread_bps: f64,
    pub down_cooldown_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub enabled: bool,
    pub min_dwell_seconds: f64,
    /// EMA below this counts as low-vol for the defensive vote.
    pub vol_threshold_bps: f64,
    pub aggressive: RegimeProfileConfig,
    pub defensive: RegimeProfileConfig,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_dwell_seconds: 60.0,
            vol_threshold_bps: 6.0,
            aggressive: RegimeProfileConfig {
                size_multiplier: 1.0,
                extra_spread_bps: 0.0,
                down_cooldown_seconds: 20.0,
            },
            defensive: RegimeProfileConfig {
                size_multiplier: 0.7,
                extra_spread_bps: 2.0,
                down_cooldown_seconds: 60.0,
            },
        }
    }
}

impl Default for RegimeProfileConfig {
    fn default() -> Self {
        Self { size_multiplier: 1.0, extra_spread_bps: 0.0, down_cooldown_seconds: 20.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PnlGuardConfig {
    pub enabled: bool,
    pub realized_floor_quote: Decimal,
    pub trigger_consecutive: u32,
    pub widen_bps: f64,
    pub size_multiplier: f64,
    pub max_extra_bps: f64,
    pub min_size_multiplier: f64,
    pub cooldown_seconds: f64,
    pub check_interval_seconds: f64,
}

impl Default for PnlGuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            realized_floor_quote: dec!(-0.20),
            trigger_consecutive: 1,
            widen_bps: 6.0,
            size_multiplier: 0.85,
            max_extra_bps: 10.0,
            min_size_multiplier: 0.6,
            cooldown_seconds: 120.0,
            check_interval_seconds: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub enabled: bool,
    /// Tiered |inventory| thresholds for spread widening / size cuts.
    pub threshold_low: Decimal,
    pub threshold_med: Decimal,
    pub threshold_high: Decimal,
    pub spread_bps_low: f64,
    pub spread_bps_med: f64,
    pub spread_bps_high: f64,
    pub size_mult_low: f64,
    pub size_mult_med: f64,
    /// Above this |inventory| the position-increasing side is suppressed.
    pub asymmetric_threshold_units: Decimal,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_low: dec!(0.01),
            threshold_med: dec!(0.02),
            threshold_high: dec!(0.03),
            spread_bps_low: 2.0,
            spread_bps_med: 4.0,
            spread_bps_high: 6.0,
            size_mult_low: 0.75,
            size_mult_med: 0.50,
            asymmetric_threshold_units: dec!(0.02),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Hedger
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HedgerConfig {
    pub enabled: bool,
    /// Defaults to the maker pair when absent.
    pub market: Option<String>,
    pub trigger_units: Decimal,
    /// When set, both the unit AND the notional trigger must be exceeded.
    pub trigger_notional: Option<Decimal>,
    pub target_units: Decimal,
    pub max_clip_units: Decimal,
    pub price_offset_bps: f64,
    pub passive_offset_bps: f64,
    pub prefer_passive: bool,
    pub passive_wait_seconds: f64,
    pub passive_timeout_seconds: f64,
    pub poll_interval_seconds: f64,
    pub cooldown_seconds: f64,
    pub max_slippage_bps: f64,
    pub max_attempts: u32,
    pub retry_backoff_seconds: f64,
    pub guard_emergency_seconds: f64,
    pub guard_emergency_clip_multiplier: f64,
    pub guard_emergency_extra_bps: f64,
    pub guard_clip_multiplier: f64,
    /// None = decide from fees (zero taker rate forces dry-run).
    pub dry_run: Option<bool>,
}

impl Default for HedgerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            market: None,
            trigger_units: dec!(0.01),
            trigger_notional: None,
            target_units: Decimal::ZERO,
            max_clip_units: dec!(0.01),
            price_offset_bps: 6.0,
            passive_offset_bps: 2.0,
            prefer_passive: true,
            passive_wait_seconds: 1.0,
            passive_timeout_seconds: 6.0,
            poll_interval_seconds: 1.5,
            cooldown_seconds: 10.0,
            max_slippage_bps: 15.0,
            max_attempts: 3,
            retry_backoff_seconds: 0.5,
            guard_emergency_seconds: 30.0,
            guard_emergency_clip_multiplier: 1.5,
            guard_emergency_extra_bps: 4.0,
            guard_clip_multiplier: 0.5,
            dry_run: None,
        }
    }
}

impl HedgerConfig {
    /// Zero taker fees look like free hedging; that usually means the fee
    /// tier is not configured, so live routing must be opted into.
    pub fn effective_dry_run(&self, taker_actual_rate: Decimal) -> bool {
        self.dry_run.unwrap_or_else(|| taker_actual_rate.is_zero())
    }
}

// ─────────────────────────────────────────────────────────
// Fees, guard, ambient services
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeesConfig {
    pub maker_actual_rate: Decimal,
    pub taker_actual_rate: Decimal,
    pub maker_premium_rate: Decimal,
    pub taker_premium_rate: Decimal,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            maker_actual_rate: Decimal::ZERO,
            taker_actual_rate: Decimal::ZERO,
            maker_premium_rate: dec!(0.00002),
            taker_premium_rate: dec!(0.0002),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub price_band_bps: Decimal,
    pub crossed_book_protection: bool,
    pub max_position_units: Decimal,
    pub max_inventory_notional: Decimal,
    pub kill_on_crossed_book: bool,
    pub kill_on_inventory_breach: bool,
    pub backoff_seconds_on_block: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            price_band_bps: dec!(50),
            crossed_book_protection: true,
            max_position_units: dec!(0.01),
            max_inventory_notional: dec!(1000),
            kill_on_crossed_book: true,
            kill_on_inventory_breach: true,
            backoff_seconds_on_block: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { enabled: true, webhook_url: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enabled: false, port: 9100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub ws_stale_seconds: f64,
    pub quote_stale_seconds: f64,
    pub reminder_every_seconds: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { ws_stale_seconds: 30.0, quote_stale_seconds: 20.0, reminder_every_seconds: 300.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: String,
    pub archive_dir: Option<String>,
    pub max_bytes: Option<u64>,
    /// Side journal for exchange-reported position PnL snapshots.
    pub positions_path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: "data/metrics/fills.jsonl".to_string(),
            archive_dir: Some("data/metrics/archive".to_string()),
            max_bytes: None,
            positions_path: "data/metrics/positions.jsonl".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
