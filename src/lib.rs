pub mod alerts;
pub mod config;
pub mod exchange;
pub mod ledger;
pub mod mm;
pub mod state;
pub mod telemetry;

/// Wall-clock seconds since the unix epoch, as f64.
///
/// For timestamps, heartbeats and rolling windows only; monetary
/// quantities never pass through float.
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
