//! System configuration parsing.
//!
//! ```kdl
//! redis url="redis://127.0.0.1:6379"
//!
//! // or, for a Sentinel-monitored group:
//! // redis {
//! //     sentinel master="builds" password="secret" {
//! //         addr "redis-0:26379"
//! //         addr "redis-1:26379"
//! //     }
//! // }
//!
//! queue prefix="switchback" {
//!     job-retention "7d"
//!     callback-retention "24h"
//! }
//!
//! worker {
//!     poll-interval "5s"
//!     max-concurrent-builds 3
//! }
//!
//! callbacks {
//!     max-attempts 5
//!     backoff "exponential" base="30s" max="1h"
//! }
//! ```
//!
//! Every section and field is optional and falls back to its default.

use kdl::{KdlDocument, KdlNode};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::{ConfigError, ConfigResult, parse_duration};

/// System-wide configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SystemConfig {
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub worker: WorkerSettings,
    pub callbacks: CallbackSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    /// Standalone server. Ignored when `sentinel` is set.
    pub url: String,
    pub sentinel: Option<SentinelConfig>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            sentinel: None,
        }
    }
}

/// Reach the master of a Sentinel-monitored group instead of a fixed server.
#[derive(Debug, Clone, PartialEq)]
pub struct SentinelConfig {
    pub master_name: String,
    /// Sentinel nodes as `host:port`.
    pub addrs: Vec<String>,
    /// Password of the master.
    pub password: Option<String>,
}

/// Key layout and retention for the shared queue state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Prefix of every key the queue writes.
    pub key_prefix: String,
    /// How long job records and their logs stay queryable.
    pub job_retention: Duration,
    /// How long an undelivered callback keeps being retried.
    pub callback_retention: Duration,
    /// Maximum log entries fetched per stream read.
    pub log_batch_size: usize,
    /// How long a log tail blocks per read before checking for cancellation.
    pub log_block: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "switchback".to_string(),
            job_retention: Duration::from_secs(7 * 24 * 60 * 60),
            callback_retention: Duration::from_secs(24 * 60 * 60),
            log_batch_size: 100,
            log_block: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Explicit worker id; generated from the hostname when absent.
    pub id: Option<String>,
    /// How long a claim waits for FIFO work.
    pub poll_interval: Duration,
    pub max_concurrent_builds: usize,
    pub build_timeout: Duration,
    /// How long shutdown waits for in-flight builds.
    pub shutdown_grace: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            id: None,
            poll_interval: Duration::from_secs(5),
            max_concurrent_builds: 3,
            build_timeout: Duration::from_secs(30 * 60),
            shutdown_grace: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSettings {
    pub kind: BackoffKind,
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base: Duration::from_secs(30),
            max: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallbackSettings {
    /// Bearer token sent to the callback receiver.
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff: BackoffSettings,
    pub request_timeout: Duration,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            max_attempts: 5,
            backoff: BackoffSettings::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        let name = node.name().value();
        if matches!(name, "redis" | "queue" | "worker" | "callbacks") && !seen.insert(name) {
            return Err(ConfigError::Duplicate(format!("section '{name}'")));
        }

        match name {
            "redis" => config.redis = parse_redis(node)?,
            "queue" => config.queue = parse_queue(node)?,
            "worker" => config.worker = parse_worker(node)?,
            "callbacks" => config.callbacks = parse_callbacks(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_redis(node: &KdlNode) -> ConfigResult<RedisConfig> {
    let mut redis = RedisConfig::default();

    for child in children(node) {
        if child.name().value() == "sentinel" {
            if redis.sentinel.is_some() {
                return Err(ConfigError::Duplicate("redis sentinel".to_string()));
            }
            redis.sentinel = Some(parse_sentinel(child)?);
        }
    }

    match get_string_prop(node, "url").or_else(|| get_first_string_arg(node)) {
        Some(url) => redis.url = check_redis_url(url)?,
        None if redis.sentinel.is_none() => {
            return Err(ConfigError::MissingField("redis url".to_string()));
        }
        None => {}
    }

    Ok(redis)
}

fn check_redis_url(url: String) -> ConfigResult<String> {
    let parsed = Url::parse(&url).map_err(|e| ConfigError::invalid("redis url", e.to_string()))?;
    if !matches!(parsed.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
        return Err(ConfigError::invalid(
            "redis url",
            format!("unsupported scheme: {}", parsed.scheme()),
        ));
    }
    Ok(url)
}

fn parse_sentinel(node: &KdlNode) -> ConfigResult<SentinelConfig> {
    let master_name = get_string_prop(node, "master")
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ConfigError::MissingField("sentinel master".to_string()))?;

    let mut addrs = Vec::new();
    for child in children(node) {
        if child.name().value() == "addr" {
            let addr = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField("sentinel addr".to_string()))?;
            if addr.is_empty() || addr.contains(char::is_whitespace) {
                return Err(ConfigError::invalid("sentinel addr", format!("bad address {addr:?}")));
            }
            addrs.push(addr);
        }
    }
    if addrs.is_empty() {
        return Err(ConfigError::MissingField("sentinel addr".to_string()));
    }

    Ok(SentinelConfig {
        master_name,
        addrs,
        password: get_string_prop(node, "password"),
    })
}

fn parse_queue(node: &KdlNode) -> ConfigResult<QueueConfig> {
    let mut queue = QueueConfig::default();

    if let Some(prefix) = get_string_prop(node, "prefix") {
        if prefix.is_empty() || prefix.contains(char::is_whitespace) {
            return Err(ConfigError::invalid("queue prefix", "must be a non-empty word"));
        }
        queue.key_prefix = prefix;
    }

    for child in children(node) {
        match child.name().value() {
            "job-retention" => queue.job_retention = child_duration(child)?,
            "callback-retention" => queue.callback_retention = child_duration(child)?,
            "log-batch" => queue.log_batch_size = child_count(child)?,
            "log-block" => queue.log_block = child_duration(child)?,
            _ => {}
        }
    }

    if queue.job_retention.is_zero() || queue.callback_retention.is_zero() {
        return Err(ConfigError::invalid("queue retention", "must be greater than zero"));
    }

    Ok(queue)
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerSettings> {
    let mut worker = WorkerSettings::default();

    for child in children(node) {
        match child.name().value() {
            "id" => worker.id = get_first_string_arg(child),
            "poll-interval" => worker.poll_interval = child_duration(child)?,
            "max-concurrent-builds" => worker.max_concurrent_builds = child_count(child)?,
            "build-timeout" => worker.build_timeout = child_duration(child)?,
            "shutdown-grace" => worker.shutdown_grace = child_duration(child)?,
            _ => {}
        }
    }

    Ok(worker)
}

fn parse_callbacks(node: &KdlNode) -> ConfigResult<CallbackSettings> {
    let mut callbacks = CallbackSettings::default();

    for child in children(node) {
        match child.name().value() {
            "api-key" => callbacks.api_key = get_first_string_arg(child),
            "poll-interval" => callbacks.poll_interval = child_duration(child)?,
            "batch-size" => callbacks.batch_size = child_count(child)?,
            "max-attempts" => {
                callbacks.max_attempts = u32::try_from(child_count(child)?)
                    .map_err(|_| ConfigError::invalid("max-attempts", "too large"))?;
            }
            "backoff" => callbacks.backoff = parse_backoff(child)?,
            "request-timeout" => callbacks.request_timeout = child_duration(child)?,
            _ => {}
        }
    }

    Ok(callbacks)
}

fn parse_backoff(node: &KdlNode) -> ConfigResult<BackoffSettings> {
    let mut backoff = BackoffSettings::default();

    if let Some(kind) = get_first_string_arg(node) {
        backoff.kind = match kind.as_str() {
            "fixed" => BackoffKind::Fixed,
            "linear" => BackoffKind::Linear,
            "exponential" => BackoffKind::Exponential,
            other => {
                return Err(ConfigError::invalid(
                    "backoff",
                    format!("unknown backoff kind: {other}"),
                ));
            }
        };
    }
    if let Some(base) = get_string_prop(node, "base") {
        backoff.base = parse_duration("backoff base", &base)?;
    }
    if let Some(max) = get_string_prop(node, "max") {
        backoff.max = parse_duration("backoff max", &max)?;
    }

    if backoff.base.is_zero() {
        return Err(ConfigError::invalid("backoff base", "must be greater than zero"));
    }
    if backoff.max < backoff.base {
        return Err(ConfigError::invalid("backoff max", "must not be below base"));
    }

    Ok(backoff)
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn child_duration(node: &KdlNode) -> ConfigResult<Duration> {
    let field = node.name().value();
    let value = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    parse_duration(field, &value)
}

fn child_count(node: &KdlNode) -> ConfigResult<usize> {
    let field = node.name().value();
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;

    match usize::try_from(value) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::invalid(field, format!("expected a positive integer, got {value}"))),
    }
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}
