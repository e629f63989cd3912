//! KDL configuration parsing for switchback.
//!
//! This crate handles parsing of:
//! - System configuration (switchback.kdl)
//! - Human-readable durations ("30s", "7d")

pub mod duration;
pub mod error;
pub mod system;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use system::{
    BackoffKind, BackoffSettings, CallbackSettings, QueueConfig, RedisConfig, SentinelConfig,
    SystemConfig, WorkerSettings, load_config, parse_system_config,
};
