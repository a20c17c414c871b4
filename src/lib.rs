//! Position lifecycle engine for Solana token positions
//!
//! Reprices open positions on a fixed interval, evaluates stop-loss,
//! take-profit, stale-trade and DCA triggers, and executes the resulting swaps
//! under a per-position lock and idempotency claims.

pub mod config;
pub mod coord;
pub mod engine;
pub mod error;
pub mod state;
pub mod triggers;
pub mod types;
pub mod venue;

#[cfg(test)]
mod test_utils;

pub use config::{AgentConfig, AgentRegistry, EngineConfig};
pub use engine::{Collaborators, PositionEngine, PurchaseRequest, TradeExecutor, TradeOutcome};
pub use error::{EngineError, EngineResult, ErrorCode};
