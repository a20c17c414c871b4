//! Cross-process coordination: shared KV, position locks and idempotency claims

pub mod idempotency;
pub mod kv;
pub mod lock;

pub use idempotency::*;
pub use kv::*;
pub use lock::*;
