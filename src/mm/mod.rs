pub mod account_ws;
pub mod guard;
pub mod hedger;
pub mod maker;
pub mod market_ws;
pub mod messages;
pub mod pnl_guard;
pub mod regime;
pub mod trend;
pub mod volatility;
