//! Position, balance and trade state with its durable store

pub mod ledger;
pub mod position;
pub mod positions;
pub mod records;
pub mod store;

pub use ledger::*;
pub use position::*;
pub use positions::*;
pub use records::*;
pub use store::*;
