//! Build log output.

use anyhow::{Context, Result};
use futures::StreamExt;
use switchback_core::{JobId, LogCursor, LogLine};
use switchback_queue::BuildQueue;

use super::interrupt_token;

const PAGE_SIZE: usize = 500;

/// Print a job's log from `from`, optionally following it until Ctrl-C.
pub async fn print(queue: &BuildQueue, id: &str, from: Option<&str>, follow: bool) -> Result<()> {
    let id: JobId = id
        .parse()
        .with_context(|| format!("Invalid job ID: {}", id))?;
    let mut cursor = match from {
        Some(from) => from.parse::<LogCursor>()?,
        None => LogCursor::start(),
    };

    if follow {
        let mut lines = queue.stream_logs(id, cursor, interrupt_token());
        while let Some(line) = lines.next().await {
            print_line(&line?);
        }
        return Ok(());
    }

    loop {
        let page = queue.read_logs(id, &cursor, PAGE_SIZE).await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = last.cursor.clone();
        page.iter().for_each(print_line);
    }
    Ok(())
}

fn print_line(line: &LogLine) {
    println!("{} {}", line.timestamp.format("%H:%M:%S%.3f"), line.line);
}
