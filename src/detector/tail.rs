//! Follow an append-only log file, yielding complete lines.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::info;

/// A poll-based tailer positioned at the end of the file on open, so only
/// lines written after startup are observed.
///
/// Partial lines (written without a trailing newline yet) are buffered
/// until the writer completes them.
pub struct LogTail {
    reader: BufReader<File>,
    poll_interval: Duration,
    pending: String,
}

impl LogTail {
    pub async fn open(path: &Path, poll_interval: Duration) -> std::io::Result<Self> {
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::End(0)).await?;
        info!(path = %path.display(), "tailing log");
        Ok(Self {
            reader: BufReader::new(file),
            poll_interval,
            pending: String::new(),
        })
    }

    /// Next complete line, without its trailing newline. Waits as long as
    /// it takes for one to appear.
    pub async fn next_line(&mut self) -> std::io::Result<String> {
        loop {
            let n = self.reader.read_line(&mut self.pending).await?;
            if n == 0 {
                // at EOF; the writer may append more later
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }
            if self.pending.ends_with('\n') {
                let line = self.pending.trim_end_matches(['\n', '\r']).to_string();
                self.pending.clear();
                return Ok(line);
            }
            // mid-line read; keep accumulating
        }
    }
}
