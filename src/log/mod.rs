//! Run summary and per-line timing log.
//!
//! The live console stream goes through `tracing`. Alongside it, every run
//! accumulates an ordered summary of result lines (`RunLog`) that is dumped
//! when the run finishes and can be written out as JSON lines for a build
//! report. `TimingsLog` records each host log line with the wall-clock time
//! it was read, which makes it possible to see where a run stalled.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Wall-clock time of day as `HH:MM:SS.mmm` (UTC).
pub fn clock_time(at: DateTime<Utc>) -> String {
    at.format("%H:%M:%S%.3f").to_string()
}

/// One entry of the end-of-run summary.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SummaryEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub is_error: bool,
}

/// Ordered list of result lines collected over a whole invocation.
#[derive(Debug, Default)]
pub struct RunLog {
    entries: Vec<SummaryEntry>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a non-error result line.
    pub fn result_info(&mut self, message: impl Into<String>) {
        self.push(message.into(), false);
    }

    /// Record an error result line.
    pub fn result_error(&mut self, message: impl Into<String>) {
        self.push(message.into(), true);
    }

    fn push(&mut self, message: String, is_error: bool) {
        debug!(is_error, message = %message, "run summary entry");
        self.entries.push(SummaryEntry {
            timestamp: Utc::now(),
            message,
            is_error,
        });
    }

    pub fn entries(&self) -> &[SummaryEntry] {
        &self.entries
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.is_error)
    }

    /// Human-readable dump, one entry per line, errors tagged `[Error]`.
    pub fn render(&self) -> String {
        let mut out = format!("{}: Run summary:\n", clock_time(Utc::now()));
        for entry in &self.entries {
            if entry.is_error {
                out.push_str(&format!("[Error] {}\n", entry.message));
            } else {
                out.push_str(&format!("{}\n", entry.message));
            }
        }
        out
    }

    /// Write the summary as JSON lines, replacing any existing file.
    pub fn write_jsonl(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create summary directory: {}", parent.display())
                })?;
            }
        }

        let file = File::create(path)
            .with_context(|| format!("failed to create summary file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            let json =
                serde_json::to_string(entry).context("failed to serialize summary entry")?;
            writeln!(writer, "{json}").context("failed to write summary entry")?;
        }
        writer.flush().context("failed to flush summary file")?;
        Ok(())
    }
}

/// Timestamped copy of every host log line the crawler consumed.
pub struct TimingsLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl TimingsLog {
    /// Path of the timings log that belongs to `log_file`.
    pub fn path_for(log_file: &Path) -> PathBuf {
        let mut name = log_file.as_os_str().to_os_string();
        name.push(".timings.log");
        PathBuf::from(name)
    }

    /// Create (truncating) the timings log next to `log_file`.
    pub fn create(log_file: &Path) -> Result<Self> {
        let path = Self::path_for(log_file);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create log directory: {}", parent.display())
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open timings log: {}", path.display()))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    /// Append one line. Failures are logged and swallowed.
    pub fn record(&mut self, line: &str) {
        let stamp = clock_time(Utc::now());
        if let Err(e) = writeln!(self.writer, "{stamp}: {line}") {
            warn!(path = %self.path.display(), error = %e, "failed to write timings log");
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(path = %self.path.display(), error = %e, "failed to flush timings log");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TimingsLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn clock_time_has_millisecond_precision() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(clock_time(at), "09:05:07.042");
    }

    #[test]
    fn summary_keeps_insertion_order_and_error_tags() {
        let mut log = RunLog::new();
        log.result_info("Command execution took: 3s");
        log.result_error("Run has failed");
        log.result_info("done");

        let messages: Vec<_> = log.entries().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["Command execution took: 3s", "Run has failed", "done"]);
        assert!(log.has_errors());

        let rendered = log.render();
        assert!(rendered.contains("Run summary:"));
        assert!(rendered.contains("[Error] Run has failed"));
        assert!(!rendered.contains("[Error] done"));
    }

    #[test]
    fn empty_summary_has_no_errors() {
        let log = RunLog::new();
        assert!(!log.has_errors());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn write_jsonl_emits_one_object_per_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("reports").join("summary.jsonl");

        let mut log = RunLog::new();
        log.result_info("Test results:");
        log.result_error("Test result sums don't match");
        log.write_jsonl(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["message"], "Test results:");
        assert_eq!(first["is_error"], false);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["is_error"], true);
        assert!(second.get("timestamp").is_some());
    }

    #[test]
    fn timings_log_sits_next_to_host_log() {
        let path = TimingsLog::path_for(Path::new("/tmp/out/Editor.log"));
        assert_eq!(path, PathBuf::from("/tmp/out/Editor.log.timings.log"));
    }

    #[test]
    fn timings_log_prefixes_each_line_with_time() {
        let tmp = tempfile::tempdir().unwrap();
        let host_log = tmp.path().join("Editor.log");

        {
            let mut timings = TimingsLog::create(&host_log).unwrap();
            timings.record("Cleanup mono");
            timings.record("second line");
        }

        let content = std::fs::read_to_string(TimingsLog::path_for(&host_log)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(": Cleanup mono"));
        // HH:MM:SS.mmm
        assert_eq!(lines[0].find(": "), Some(12));
    }

    #[test]
    fn timings_log_truncates_previous_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let host_log = tmp.path().join("Editor.log");

        {
            let mut timings = TimingsLog::create(&host_log).unwrap();
            timings.record("attempt one");
        }
        {
            let mut timings = TimingsLog::create(&host_log).unwrap();
            timings.record("attempt two");
        }

        let content = std::fs::read_to_string(TimingsLog::path_for(&host_log)).unwrap();
        assert!(!content.contains("attempt one"));
        assert!(content.contains("attempt two"));
    }
}
