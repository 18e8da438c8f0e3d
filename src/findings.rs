//! Run-wide warning and error accumulation.
//!
//! Lists persist across retries for one invocation. Each flush prints the
//! entries not printed yet, up to a display limit shared by the whole
//! invocation, and records the printed errors in the run summary.

use tracing::{error, info, warn};

use crate::log::RunLog;

/// Default number of warnings (and errors) printed per invocation.
pub const DEFAULT_DISPLAY_LIMIT: usize = 30;

#[derive(Debug, Default)]
struct Shown {
    printed: usize,
    noted_total: usize,
}

/// Accumulated warnings and errors for one invocation.
#[derive(Debug)]
pub struct Findings {
    warnings: Vec<String>,
    errors: Vec<String>,
    display_limit: usize,
    shown_warnings: Shown,
    shown_errors: Shown,
}

impl Default for Findings {
    fn default() -> Self {
        Self::new(DEFAULT_DISPLAY_LIMIT)
    }
}

impl Findings {
    pub fn new(display_limit: usize) -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
            display_limit,
            shown_warnings: Shown::default(),
            shown_errors: Shown::default(),
        }
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Whether the accumulated findings fail the run on their own.
    pub fn is_failed(&self, treat_warnings_as_failures: bool) -> bool {
        self.has_errors() || (treat_warnings_as_failures && self.has_warnings())
    }

    /// Print everything not printed yet, within the display limit.
    pub fn flush(&mut self, summary: &mut RunLog) {
        let limit = self.display_limit;

        let fresh = next_batch(&self.warnings, &mut self.shown_warnings, limit);
        if !fresh.is_empty() {
            info!("Found warnings:");
        }
        for message in fresh {
            warn!("{message}");
        }
        if let Some(note) = withheld_note("warnings", self.warnings.len(), &mut self.shown_warnings)
        {
            warn!("{note}");
            summary.result_info(note);
        }

        let fresh = next_batch(&self.errors, &mut self.shown_errors, limit);
        if !fresh.is_empty() {
            info!("Found errors:");
        }
        for message in fresh {
            error!("{message}");
            summary.result_error(message.clone());
        }
        if let Some(note) = withheld_note("errors", self.errors.len(), &mut self.shown_errors) {
            error!("{note}");
            summary.result_error(note);
        }
    }
}

fn next_batch<'a>(all: &'a [String], shown: &mut Shown, limit: usize) -> &'a [String] {
    let end = all.len().min(limit).max(shown.printed);
    let batch = &all[shown.printed..end];
    shown.printed = end;
    batch
}

fn withheld_note(kind: &str, total: usize, shown: &mut Shown) -> Option<String> {
    if total <= shown.printed || total == shown.noted_total {
        return None;
    }
    shown.noted_total = total;
    Some(format!(
        "Did not print all {kind}: {} of {total} printed, {} withheld",
        shown.printed,
        total - shown.printed
    ))
}
