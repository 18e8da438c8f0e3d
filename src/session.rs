//! Test session tracking for the structured protocol.
//!
//! At most one test is open at a time. Log entries emitted while a test is
//! open are buffered instead of being reported, and only surface if the
//! test ends in a failed state.

use tracing::{debug, info};

use crate::utp::{LogEntry, TestPlan, TestState, TestStatus};

/// A finished test that ended in `Failure` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub struct TestFailure {
    pub name: String,
    pub state: TestState,
    pub message: String,
    pub logs: Vec<LogEntry>,
}

impl TestFailure {
    /// Multi-line report: header, message, then the captured in-test log.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Test '{}' reported state '{}' with message:\n{}",
            self.name, self.state, self.message
        );
        if !self.logs.is_empty() {
            out.push_str("\n  Logging in failed test was:");
            for entry in &self.logs {
                out.push_str("\n  ");
                out.push_str(&entry.render());
            }
        }
        out
    }
}

#[derive(Debug)]
struct OpenTest {
    name: String,
    logs: Vec<LogEntry>,
}

/// Tracks the currently open test and test-plan progress.
#[derive(Debug, Default)]
pub struct TestSessions {
    open: Option<OpenTest>,
    planned: Option<usize>,
    finished: usize,
}

impl TestSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a test is currently open.
    pub fn in_test(&self) -> bool {
        self.open.is_some()
    }

    /// Name of the open test, if any.
    pub fn current(&self) -> Option<&str> {
        self.open.as_ref().map(|t| t.name.as_str())
    }

    /// Entries buffered for the open test.
    pub fn buffered(&self) -> &[LogEntry] {
        self.open.as_ref().map(|t| t.logs.as_slice()).unwrap_or(&[])
    }

    pub fn planned(&self) -> Option<usize> {
        self.planned
    }

    /// Tests still expected to finish, if a plan was announced.
    pub fn remaining(&self) -> Option<usize> {
        self.planned.map(|p| p.saturating_sub(self.finished))
    }

    /// Record the announced test plan.
    pub fn plan(&mut self, plan: &TestPlan) {
        let count = plan.test_count();
        self.planned = Some(count);
        self.finished = 0;
        info!("Starting test run. {count} tests will be run");
    }

    /// Open a test. A still-open previous test is dropped with its buffer.
    pub fn begin(&mut self, name: &str) {
        if let Some(stale) = self.open.take() {
            debug!(
                stale = %stale.name,
                discarded = stale.logs.len(),
                next = name,
                "test began while another was still open"
            );
        }
        self.open = Some(OpenTest {
            name: name.to_string(),
            logs: Vec::new(),
        });
    }

    /// Buffer an entry into the open test. Returns the entry back when no
    /// test is open so the caller can report it.
    pub fn capture(&mut self, entry: LogEntry) -> Option<LogEntry> {
        match self.open.as_mut() {
            Some(test) => {
                test.logs.push(entry);
                None
            }
            None => Some(entry),
        }
    }

    /// Close the open test. Yields a failure report if the test failed.
    pub fn end(&mut self, status: &TestStatus) -> Option<TestFailure> {
        let logs = self.open.take().map(|t| t.logs).unwrap_or_default();
        self.finished += 1;

        if let Some(remaining) = self.remaining() {
            debug!(test = %status.name, remaining, "test finished");
        }

        let state = status.state?;
        if !state.is_failed() {
            return None;
        }

        Some(TestFailure {
            name: status.name.clone(),
            state,
            message: status.message.clone().unwrap_or_default(),
            logs,
        })
    }
}
