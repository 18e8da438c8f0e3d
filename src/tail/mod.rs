//! Incremental reader for a log file that another process is still writing.
//!
//! The file is reopened on every poll, seeked to the last consumed offset and
//! read to its current end. Complete lines are queued; a trailing partial line
//! stays buffered until its newline arrives (or until the writer is known to
//! be gone, see [`LogTail::drain_remaining`]). Nothing here ever blocks: a
//! missing, locked or unchanged file is reported to the caller, who decides
//! how long to back off.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, trace};

/// Result of asking the tail for its next line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line, without its terminator.
    Line(String),
    /// The file is readable but nothing new has been appended.
    NoData,
    /// The file does not exist yet, or the writer holds it without shared
    /// read access.
    Unavailable,
}

/// Read cursor over an append-only log file.
pub struct LogTail {
    path: PathBuf,
    position: u64,
    partial: Vec<u8>,
    ready: VecDeque<String>,
}

impl LogTail {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            position: 0,
            partial: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset consumed so far (including any buffered partial line).
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Forget everything read so far. Used when the file is recreated.
    pub fn reset(&mut self) {
        self.position = 0;
        self.partial.clear();
        self.ready.clear();
    }

    /// Next complete line, or why there is none right now.
    pub fn next_line(&mut self) -> LineRead {
        if let Some(line) = self.ready.pop_front() {
            return LineRead::Line(line);
        }

        match self.poll() {
            Ok(true) => {}
            Ok(false) => return LineRead::Unavailable,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "log not readable yet");
                return LineRead::Unavailable;
            }
        }

        match self.ready.pop_front() {
            Some(line) => LineRead::Line(line),
            None => LineRead::NoData,
        }
    }

    /// Read everything left in the file, including a final unterminated
    /// line. Call once the writer has exited.
    pub fn drain_remaining(&mut self) -> Result<Vec<String>> {
        match self.poll() {
            Ok(_) => {}
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "final drain could not read log");
            }
        }

        if !self.partial.is_empty() {
            let tail = std::mem::take(&mut self.partial);
            self.ready.push_back(decode_line(&tail));
        }

        Ok(self.ready.drain(..).collect())
    }

    /// Pull newly appended bytes into the line queue.
    ///
    /// Returns `Ok(false)` when the file does not exist.
    fn poll(&mut self) -> Result<bool> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open log: {}", self.path.display()));
            }
        };

        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if file_len < self.position {
            debug!(
                path = %self.path.display(),
                position = self.position,
                file_len,
                "log shrank; assuming it was recreated"
            );
            self.reset();
        }

        if file_len == self.position {
            return Ok(true);
        }

        file.seek(SeekFrom::Start(self.position))
            .context("failed to seek in log")?;

        let mut new_bytes = Vec::new();
        let n = file
            .read_to_end(&mut new_bytes)
            .context("failed to read log")?;
        if n == 0 {
            return Ok(true);
        }

        self.position += n as u64;
        trace!(bytes = n, position = self.position, "read log bytes");

        self.partial.extend_from_slice(&new_bytes);
        let mut start = 0;
        while let Some(offset) = self.partial[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            self.ready.push_back(decode_line(&self.partial[start..end]));
            start = end + 1;
        }
        self.partial.drain(..start);

        Ok(true)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
