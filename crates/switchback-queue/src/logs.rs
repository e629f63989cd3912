//! Per-job build log streams.

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use switchback_core::{Error, JobId, LogCursor, LogLine, LogSink, Result, StreamEntry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::BuildQueue;
use crate::keys::{FIELD_LINE, FIELD_TIMESTAMP};

impl BuildQueue {
    /// Append one line to a job's log and return its position.
    ///
    /// Appending refreshes the log's retention window.
    pub async fn append_log(&self, id: JobId, line: &str) -> Result<LogCursor> {
        let key = self.keys.logs(&id);
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);

        let position = self
            .store
            .stream_append(
                &key,
                &[(FIELD_LINE, line.to_string()), (FIELD_TIMESTAMP, timestamp)],
            )
            .await?;
        self.store.expire(&key, self.config.job_retention).await?;

        Ok(LogCursor::from(position))
    }

    /// Up to `limit` lines after `from`, without waiting for new ones.
    pub async fn read_logs(
        &self,
        id: JobId,
        from: &LogCursor,
        limit: usize,
    ) -> Result<Vec<LogLine>> {
        let entries = self
            .store
            .stream_read(&self.keys.logs(&id), from.as_str(), limit, Duration::ZERO)
            .await?;
        entries.iter().map(decode_line).collect()
    }

    /// Follow a job's log from `from` until `cancel` fires.
    ///
    /// Lines arrive in append order. The stream ends after yielding the first
    /// error; resume from the cursor of the last line received.
    pub fn stream_logs(
        &self,
        id: JobId,
        from: LogCursor,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<LogLine>> {
        let store = self.store.clone();
        let key = self.keys.logs(&id);
        let batch = self.config.log_batch_size;
        let block = self.config.log_block;

        Box::pin(stream! {
            let mut cursor = from;
            loop {
                let read = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(job_id = %id, "Log stream cancelled");
                        break;
                    }
                    read = store.stream_read(&key, cursor.as_str(), batch, block) => read,
                };

                let entries = match read {
                    Ok(entries) => entries,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                };

                for entry in &entries {
                    match decode_line(entry) {
                        Ok(line) => {
                            cursor = line.cursor.clone();
                            yield Ok(line);
                        }
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    }
                }
            }
        })
    }
}

fn decode_line(entry: &StreamEntry) -> Result<LogLine> {
    let line = entry.field(FIELD_LINE).unwrap_or_default().to_string();
    let timestamp = entry
        .field(FIELD_TIMESTAMP)
        .ok_or_else(|| Error::Serialization(format!("log entry {} has no timestamp", entry.id)))?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| Error::Serialization(format!("bad log timestamp {timestamp:?}: {e}")))?
        .with_timezone(&Utc);

    Ok(LogLine {
        cursor: LogCursor::from(entry.id.clone()),
        timestamp,
        line,
    })
}

/// Writes a running build's output into its job log.
///
/// Append failures are logged and otherwise ignored so a flaky store never
/// fails the build itself.
pub struct JobLogSink {
    queue: Arc<BuildQueue>,
    job_id: JobId,
}

impl JobLogSink {
    pub fn new(queue: Arc<BuildQueue>, job_id: JobId) -> Self {
        Self { queue, job_id }
    }
}

#[async_trait]
impl LogSink for JobLogSink {
    async fn line(&self, line: &str) {
        if let Err(e) = self.queue.append_log(self.job_id, line).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to append build log line");
        }
    }
}
