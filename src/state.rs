//! Process-wide mutable state.
//!
//! Single owner of mids, inventory, tracked open orders, fee/PnL
//! accumulators, flags and guard-block markers. One mutex per logical
//! region; every operation is synchronous and holds at most one region
//! lock, never across I/O. Readers get a consistent snapshot of a single
//! region, not across regions.

use std::collections::HashMap;
use std::sync::Mutex;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::exchange::Side;
use crate::telemetry::Telemetry;

/// A locally tracked resting order (intent, not exchange truth).
#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub market: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub placed_at: f64,
}

/// Running fee / volume / PnL totals. Never reset at runtime.
#[derive(Debug, Clone, Default)]
pub struct Accumulators {
    pub maker_notional: Decimal,
    pub taker_notional: Decimal,
    pub maker_fills: u64,
    pub taker_fills: u64,
    pub maker_fee_actual: Decimal,
    pub maker_fee_premium: Decimal,
    pub taker_fee_actual: Decimal,
    pub taker_fee_premium: Decimal,
    pub maker_edge: Decimal,
    pub taker_slippage: Decimal,
    /// Σ quote_delta − Σ fees over all fills (running realized cash).
    pub realized_cash: Decimal,
    pub fees_paid: Decimal,
    /// Per-market cumulative FIFO realized quote (signed, unbounded).
    pub fifo_realized: HashMap<String, Decimal>,
}

#[derive(Debug, Default)]
pub struct StateStore {
    mids: Mutex<HashMap<String, Decimal>>,
    inventory: Mutex<HashMap<String, Decimal>>,
    orders: Mutex<HashMap<u64, OrderInfo>>,
    accum: Mutex<Accumulators>,
    flags: Mutex<HashMap<String, bool>>,
    guard_blocks: Mutex<HashMap<String, f64>>,
    account_index: Mutex<Option<i64>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ───────────────────────────── mids ─────────────────────────────

    pub fn set_mid(&self, market: &str, price: Decimal) {
        self.mids.lock().unwrap().insert(market.to_string(), price);
    }

    pub fn get_mid(&self, market: &str) -> Option<Decimal> {
        self.mids.lock().unwrap().get(market).copied()
    }

    // ─────────────────────────── inventory ──────────────────────────

    /// Authoritative overwrite (position snapshot branch).
    pub fn set_inventory(&self, market: &str, value: Decimal) {
        self.inventory.lock().unwrap().insert(market.to_string(), value);
    }

    /// Signed delta (per-fill branch).
    pub fn update_inventory(&self, market: &str, delta: Decimal) {
        let mut inv = self.inventory.lock().unwrap();
        *inv.entry(market.to_string()).or_insert(Decimal::ZERO) += delta;
    }

    pub fn get_inventory(&self, market: &str) -> Decimal {
        self.inventory
            .lock()
            .unwrap()
            .get(market)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn get_inventory_map(&self) -> HashMap<String, Decimal> {
        self.inventory.lock().unwrap().clone()
    }

    // ──────────────────────────── orders ────────────────────────────

    pub fn add_order(&self, id: u64, info: OrderInfo) {
        self.orders.lock().unwrap().insert(id, info);
    }

    pub fn remove_order(&self, id: u64) -> Option<OrderInfo> {
        self.orders.lock().unwrap().remove(&id)
    }

    pub fn get_orders(&self, market: Option<&str>) -> HashMap<u64, OrderInfo> {
        let orders = self.orders.lock().unwrap();
        match market {
            Some(m) => orders
                .iter()
                .filter(|(_, o)| o.market == m)
                .map(|(id, o)| (*id, o.clone()))
                .collect(),
            None => orders.clone(),
        }
    }

    // ───────────────────────── accumulators ─────────────────────────

    pub fn record_volume_sample(
        &self,
        role: crate::ledger::Role,
        notional: Decimal,
        fee_actual: Decimal,
        fee_premium: Decimal,
    ) {
        let mut acc = self.accum.lock().unwrap();
        match role {
            crate::ledger::Role::Maker => {
                acc.maker_notional += notional;
                acc.maker_fills += 1;
                acc.maker_fee_actual += fee_actual;
                acc.maker_fee_premium += fee_premium;
            }
            crate::ledger::Role::Taker => {
                acc.taker_notional += notional;
                acc.taker_fills += 1;
                acc.taker_fee_actual += fee_actual;
                acc.taker_fee_premium += fee_premium;
            }
        }
    }

    pub fn record_maker_edge(&self, edge: Decimal) {
        self.accum.lock().unwrap().maker_edge += edge;
    }

    pub fn record_taker_slippage(&self, slippage_abs: Decimal) {
        self.accum.lock().unwrap().taker_slippage += slippage_abs;
    }

    pub fn record_cash_flow(&self, quote_delta: Decimal, fee_actual: Decimal) {
        let mut acc = self.accum.lock().unwrap();
        acc.realized_cash += quote_delta - fee_actual;
        acc.fees_paid += fee_actual;
    }

    /// Published by the AccountListener after each FIFO update; read by the
    /// maker's PnL guard.
    pub fn set_fifo_realized(&self, market: &str, cumulative: Decimal) {
        self.accum
            .lock()
            .unwrap()
            .fifo_realized
            .insert(market.to_string(), cumulative);
    }

    pub fn get_fifo_realized(&self, market: &str) -> Decimal {
        self.accum
            .lock()
            .unwrap()
            .fifo_realized
            .get(market)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn accumulators(&self) -> Accumulators {
        self.accum.lock().unwrap().clone()
    }

    // ──────────────────────────── flags ─────────────────────────────

    pub fn set_flag(&self, name: &str, value: bool) {
        self.flags.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn get_flag(&self, name: &str) -> bool {
        self.flags.lock().unwrap().get(name).copied().unwrap_or(false)
    }

    // ───────────────────────── guard blocks ─────────────────────────

    pub fn mark_guard_blocked(&self, market: &str, ts: f64) {
        self.guard_blocks
            .lock()
            .unwrap()
            .entry(market.to_string())
            .or_insert(ts);
    }

    pub fn clear_guard_block(&self, market: &str) {
        self.guard_blocks.lock().unwrap().remove(market);
    }

    pub fn get_guard_block_since(&self, market: &str) -> Option<f64> {
        self.guard_blocks.lock().unwrap().get(market).copied()
    }

    // ─────────────────────── account identity ───────────────────────

    pub fn set_account_index(&self, id: i64) {
        *self.account_index.lock().unwrap() = Some(id);
    }

    pub fn get_account_index(&self) -> Option<i64> {
        *self.account_index.lock().unwrap()
    }

    // ──────────────────────── gauge snapshot ────────────────────────

    /// Push the accumulator region into telemetry gauges. Read-only at the
    /// boundary; the exporter never mutates state.
    pub fn publish_gauges(&self, telemetry: &Telemetry) {
        let acc = self.accumulators();
        telemetry.set_gauge("maker_notional_total", dec_f64(acc.maker_notional));
        telemetry.set_gauge("taker_notional_total", dec_f64(acc.taker_notional));
        telemetry.set_gauge("maker_fills_total", acc.maker_fills as f64);
        telemetry.set_gauge("taker_fills_total", acc.taker_fills as f64);
        telemetry.set_gauge("maker_fee_actual_total", dec_f64(acc.maker_fee_actual));
        telemetry.set_gauge("maker_fee_premium_total", dec_f64(acc.maker_fee_premium));
        telemetry.set_gauge("taker_fee_actual_total", dec_f64(acc.taker_fee_actual));
        telemetry.set_gauge("taker_fee_premium_total", dec_f64(acc.taker_fee_premium));
        telemetry.set_gauge("maker_edge_total", dec_f64(acc.maker_edge));
        telemetry.set_gauge("taker_slippage_total", dec_f64(acc.taker_slippage));
        telemetry.set_gauge("realized_cash_total", dec_f64(acc.realized_cash));
        telemetry.set_gauge("fees_paid_total", dec_f64(acc.fees_paid));

        let total_fifo: Decimal = acc.fifo_realized.values().copied().sum();
        telemetry.set_gauge("maker_fifo_realized_quote", dec_f64(total_fifo));
        for (market, value) in &acc.fifo_realized {
            let gauge = format!("maker_fifo_realized_quote_{}", market.replace(':', "_"));
            telemetry.set_gauge(&gauge, dec_f64(*value));
        }

        for (market, inv) in self.get_inventory_map() {
            let gauge = format!("inventory_{}", market.replace(':', "_"));
            telemetry.set_gauge(&gauge, dec_f64(inv));
        }
        telemetry.set_gauge("open_orders", self.get_orders(None).len() as f64);
    }
}

fn dec_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
