//! Position lifecycle engine: poll loop, executor, events and dispatch

pub mod core;
pub mod dispatch;
pub mod events;
pub mod executor;
pub mod tracker;

pub use self::core::*;
pub use dispatch::*;
pub use events::*;
pub use executor::*;
pub use tracker::*;
