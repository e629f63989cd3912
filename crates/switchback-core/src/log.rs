//! Build log lines and stream positions.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::Error;

/// A position in a job's log stream.
///
/// Positions have the form `<millis>-<seq>` and are assigned by the store when
/// a line is appended. Reading from a cursor yields the lines positioned after
/// it, so resuming from the cursor of the last line seen neither drops nor
/// repeats anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct LogCursor(String);

impl LogCursor {
    /// The position before the first line.
    pub fn start() -> Self {
        Self("0".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LogCursor {
    fn default() -> Self {
        Self::start()
    }
}

impl FromStr for LogCursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = match s.split_once('-') {
            Some((ms, seq)) => is_digits(ms) && is_digits(seq),
            None => is_digits(s),
        };
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::Validation(format!("invalid log cursor: {s:?}")))
        }
    }
}

impl From<String> for LogCursor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// One appended line of build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub cursor: LogCursor,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cursor_forms() {
        assert_eq!("0".parse::<LogCursor>().unwrap(), LogCursor::start());
        let cursor: LogCursor = "1700000000000-3".parse().unwrap();
        assert_eq!(cursor.as_str(), "1700000000000-3");
    }

    #[test]
    fn test_reject_garbage_cursor() {
        assert!("abc".parse::<LogCursor>().is_err());
        assert!("12-".parse::<LogCursor>().is_err());
        assert!("".parse::<LogCursor>().is_err());
    }
}
