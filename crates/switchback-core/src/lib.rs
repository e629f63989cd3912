//! Core domain types and traits for the switchback build dispatch queue.
//!
//! This crate contains:
//! - Job, attempt and worker identifiers
//! - Job descriptions, statuses and build results
//! - Log lines and stream cursors
//! - Callback retry attempts
//! - The coordination store abstraction the queue is built on
//! - Build runner and callback sender traits used by workers

pub mod callback;
pub mod error;
pub mod id;
pub mod job;
pub mod log;
pub mod runner;
pub mod store;

pub use callback::CallbackAttempt;
pub use error::{Error, Result};
pub use id::{AttemptId, JobId, WorkerId};
pub use job::{BuildConfig, BuildResult, BuildStrategy, Job, JobSnapshot, JobStatus, NewJob};
pub use log::{LogCursor, LogLine};
pub use runner::{BuildRunner, CallbackSender, DeliveryError, LogSink};
pub use store::{CoordinationStore, StreamEntry};
