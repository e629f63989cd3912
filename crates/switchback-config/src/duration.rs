//! Duration strings such as `500ms`, `30s`, `5m`, `2h` and `7d`.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*(ms|s|m|h|d)\s*$").expect("valid regex"));

/// Parse a duration written as an integer followed by a unit.
pub fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    let caps = DURATION_RE.captures(value).ok_or_else(|| {
        ConfigError::invalid(field, format!("expected a duration like \"30s\", got {value:?}"))
    })?;

    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("duration out of range: {value}")))?;

    let millis_per_unit: u64 = match &caps[2] {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => unreachable!("regex only admits known units"),
    };

    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| ConfigError::invalid(field, format!("duration out of range: {value}")))
}
