//! Channel message types between the core loops.
//!
//! The AccountListener is the single source of truth for inventory; the
//! hedger only ever receives wake notifications from it (or from its own
//! poll timer) and re-reads authoritative state before acting.

use rust_decimal::Decimal;

use crate::exchange::Side;

/// Fill notification fanned out to the hedger. Carries enough context to
/// log usefully; the hedger re-reads StateStore before deciding anything.
#[derive(Debug, Clone)]
pub struct FillNotice {
    pub market: String,
    pub side: Side,
    pub base_delta: Decimal,
    pub price: Decimal,
    pub timestamp: f64,
}

/// Which sides survive bias filtering for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledSides {
    pub bid: bool,
    pub ask: bool,
}

impl EnabledSides {
    pub fn both() -> Self {
        Self { bid: true, ask: true }
    }

    pub fn none(&self) -> bool {
        !self.bid && !self.ask
    }
}
