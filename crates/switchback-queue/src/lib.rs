//! Build dispatch queue for switchback.
//!
//! Admits build jobs into a priority structure or a FIFO structure, hands each
//! one to exactly one worker, tracks its lifecycle and logs, and keeps failed
//! completion callbacks around for redelivery. All shared state lives in a
//! [`CoordinationStore`](switchback_core::CoordinationStore); correctness under
//! concurrent workers comes from the store's atomic pops, not from locks here.

pub mod admission;
pub mod callbacks;
pub mod delivery;
pub mod dispatch;
pub mod http;
pub mod keys;
pub mod lifecycle;
pub mod logs;
pub mod queue;
pub mod registry;
pub mod worker;

pub use delivery::{CallbackRetrier, RetryPassStats, RetryPolicy};
pub use http::HttpCallbackSender;
pub use queue::{BuildQueue, QueueStats};
pub use worker::Worker;

#[cfg(test)]
pub(crate) mod testing;
