//! Trigger evaluators
//!
//! Pure decision functions over a position snapshot and a price. They never
//! touch state; the poll loop runs them in order stop-loss, take-profit,
//! stale-trade, DCA and hands positive decisions to the executor.

pub mod dca;
pub mod stale;
pub mod stop_loss;
pub mod take_profit;

pub use dca::*;
pub use stale::*;
pub use stop_loss::*;
pub use take_profit::*;
