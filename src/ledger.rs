//! Append-only JSON-lines fill journal.
//!
//! One self-describing JSON object per line. Writes are serialized through
//! a per-path lock shared by every handle onto the same file, so rotation
//! never races a concurrent append or read. The ledger is advisory: a
//! failed write is logged and dropped, never propagated.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::exchange::Side;

// ─────────────────────────────────────────────────────────
// Event model
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Maker,
    Taker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Maker => "maker",
            Role::Taker => "taker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillSource {
    #[default]
    AccountListener,
    Hedger,
    Backfill,
}

/// Persistent record of a single fill.
///
/// Monetary fields are `Decimal` (serialized as strings). Field omission is
/// tolerated on read: absent fields take zero/empty defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillEvent {
    pub timestamp: f64,
    pub market: String,
    pub role: Role,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub notional: Decimal,
    pub base_delta: Decimal,
    pub quote_delta: Decimal,
    pub fee_paid: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<i64>,
    pub source: FillSource,
}

impl Default for FillEvent {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            market: String::new(),
            role: Role::Maker,
            side: Side::Bid,
            size: Decimal::ZERO,
            price: Decimal::ZERO,
            notional: Decimal::ZERO,
            base_delta: Decimal::ZERO,
            quote_delta: Decimal::ZERO,
            fee_paid: Decimal::ZERO,
            fee_currency: None,
            mid_price: None,
            trade_id: None,
            source: FillSource::AccountListener,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Per-path lock registry
// ─────────────────────────────────────────────────────────

static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    let registry = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap();
    map.entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

// ─────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────

pub struct MetricsLedger {
    path: PathBuf,
    archive_dir: Option<PathBuf>,
    max_bytes: Option<u64>,
}

impl MetricsLedger {
    pub fn new(path: impl Into<PathBuf>, archive_dir: Option<PathBuf>, max_bytes: Option<u64>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Some(dir) = &archive_dir {
            let _ = fs::create_dir_all(dir);
        }
        Self { path, archive_dir, max_bytes }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Never fails the caller.
    pub fn append(&self, event: &FillEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(err) => {
                debug!("ledger encode failed: {err}");
                return;
            }
        };
        let lock = path_lock(&self.path);
        let _guard = lock.lock().unwrap();
        self.rotate_if_needed(payload.len() as u64 + 1);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut fh| writeln!(fh, "{payload}"));
        if let Err(err) = result {
            debug!("ledger append failed: {err}");
        }
    }

    /// Read events in on-disk order. Malformed lines are skipped silently;
    /// `since_ts` filters by timestamp. The file is read under the same
    /// per-path lock that excludes concurrent rotation.
    pub fn iter_events(&self, since_ts: Option<f64>) -> Vec<FillEvent> {
        let lock = path_lock(&self.path);
        let _guard = lock.lock().unwrap();
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<FillEvent>(line) else {
                continue;
            };
            if let Some(since) = since_ts {
                if event.timestamp < since {
                    continue;
                }
            }
            events.push(event);
        }
        events
    }

    /// Archive (or delete when no archive dir is set) the current file.
    pub fn reset(&self) -> Option<PathBuf> {
        let lock = path_lock(&self.path);
        let _guard = lock.lock().unwrap();
        if !self.path.exists() {
            return None;
        }
        match &self.archive_dir {
            Some(dir) => {
                let target = dir.join(archive_name());
                match fs::rename(&self.path, &target) {
                    Ok(()) => Some(target),
                    Err(err) => {
                        debug!("ledger reset rename failed: {err}");
                        None
                    }
                }
            }
            None => {
                let _ = fs::remove_file(&self.path);
                None
            }
        }
    }

    // caller holds the path lock
    fn rotate_if_needed(&self, incoming_bytes: u64) {
        let Some(max_bytes) = self.max_bytes else { return };
        let Ok(meta) = fs::metadata(&self.path) else { return };
        if meta.len() + incoming_bytes <= max_bytes {
            return;
        }
        match &self.archive_dir {
            Some(dir) => {
                let target = dir.join(archive_name());
                if let Err(err) = fs::rename(&self.path, &target) {
                    debug!("ledger rotation failed: {err}");
                }
            }
            None => {
                // best effort: keep the file bounded
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

fn archive_name() -> String {
    format!("fills-{}.jsonl", chrono::Utc::now().format("%Y%m%d-%H%M%S"))
}

// ─────────────────────────────────────────────────────────
// Position-PnL side journal
// ─────────────────────────────────────────────────────────

/// Exchange-reported per-position PnL snapshot, appended whenever the
/// account channel delivers one. Matches the venue UI exactly, so it is
/// the cheapest source of truth for offline PnL analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionPnl {
    pub timestamp: f64,
    pub market: String,
    pub position: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
}

pub struct PositionJournal {
    path: PathBuf,
}

impl PositionJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        Self { path }
    }

    pub fn append(&self, entry: &PositionPnl) {
        let Ok(payload) = serde_json::to_string(entry) else { return };
        let lock = path_lock(&self.path);
        let _guard = lock.lock().unwrap();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut fh| writeln!(fh, "{payload}"));
        if let Err(err) = result {
            debug!("position journal append failed: {err}");
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

    fn sample(ts: f64, size: Decimal) -> FillEvent {
        FillEvent {
            timestamp: ts,
            market: "market:2".into(),
            role: Role::Maker,
            side: Side::Bid,
            size,
            price: dec!(100.5),
            notional: size * dec!(100.5),
            base_delta: size,
            quote_delta: -(size * dec!(100.5)),
            fee_paid: Decimal::ZERO,
            mid_price: Some(dec!(100.4)),
            trade_id: Some(42),
            ..FillEvent::default()
        }
    }

    #[test]
    fn test_append_then_iter_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = MetricsLedger::new(dir.path().join("fills.jsonl"), None, None);
        let event = sample(10.0, dec!(1.5));
        ledger.append(&event);

        let read = ledger.iter_events(None);
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], event);
    }

    #[test]
    fn test_since_ts_filter_and_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fills.jsonl");
        let ledger = MetricsLedger::new(path.clone(), None, None);
        ledger.append(&sample(10.0, dec!(1)));
        ledger.append(&sample(20.0, dec!(2)));

        // corrupt line in the middle is skipped silently
        {
            let mut fh = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(fh, "{{not json").unwrap();
        }
        ledger.append(&sample(30.0, dec!(3)));

        let all = ledger.iter_events(None);
        assert_eq!(all.len(), 3);
        let recent = ledger.iter_events(Some(15.0));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].size, dec!(2));
    }

    #[test]
    fn test_field_omission_defaults_on_read() {
        let line = r#"{"timestamp": 5.0, "market": "market:1", "side": "ask"}"#;
        let event: FillEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.side, Side::Ask);
        assert_eq!(event.size, Decimal::ZERO);
        assert_eq!(event.role, Role::Maker);
        assert_eq!(event.source, FillSource::AccountListener);
        assert!(event.mid_price.is_none());
    }

    #[test]
    fn test_rotation_into_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let ledger = MetricsLedger::new(
            dir.path().join("fills.jsonl"),
            Some(archive.clone()),
            Some(200),
        );
        for i in 0..10 {
            ledger.append(&sample(i as f64, dec!(1)));
        }
        let archived: Vec<_> = fs::read_dir(&archive).unwrap().collect();
        assert!(!archived.is_empty(), "expected at least one rotated file");
        // current file stays under the cap plus one event
        let live = ledger.iter_events(None);
        assert!(live.len() < 10);
    }

    #[test]
    fn test_reset_archives_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let ledger = MetricsLedger::new(
            dir.path().join("fills.jsonl"),
            Some(archive.clone()),
            None,
        );
        ledger.append(&sample(1.0, dec!(1)));
        let target = ledger.reset();
        assert!(target.is_some());
        assert!(target.unwrap().exists());
        assert!(ledger.iter_events(None).is_empty());
        assert!(ledger.reset().is_none());
    }
}
