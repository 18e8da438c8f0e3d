//! Scan of the host's cleaned log (warnings, errors and assertions only).

use std::path::Path;

use anyhow::{Context, Result};
use tracing::error;

use crate::log::RunLog;

/// Number of offending lines reported.
pub const MAX_REPORTED: usize = 10;

/// First offending lines: assertions and `(Error: ` lines.
pub fn scan(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| line.starts_with("Assertion Failed:") || line.contains("(Error: "))
        .take(MAX_REPORTED)
        .map(str::to_string)
        .collect()
}

/// Check the cleaned log. Returns `true` when it is clean or absent.
pub fn check(path: &Path, summary: &mut RunLog) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cleaned log: {}", path.display()))?;

    let offending = scan(&content);
    if offending.is_empty() {
        return Ok(true);
    }

    summary.result_error(format!(
        "{} contains errors and/or assertions. Failing run",
        path.display()
    ));
    error!("Cleaned output file is not empty. Here are the first {MAX_REPORTED} errors and assertions:");
    for line in &offending {
        error!("{line}");
    }
    Ok(false)
}
