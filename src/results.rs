//! Post-run check of the XML test results file.
//!
//! The root element carries `total`/`passed`/`failed`/`inconclusive`/
//! `skipped` counts. Failures are found by walking nested `test-suite`
//! elements down to `test-case` elements with a `failure` child.

use std::path::Path;

use roxmltree::{Document, Node};
use thiserror::Error;
use tracing::error;

use crate::log::RunLog;

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse test results XML: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("root element is missing the '{0}' attribute")]
    MissingCount(&'static str),

    #[error("attribute '{name}' is not a number: {value:?}")]
    BadCount { name: &'static str, value: String },
}

/// Counts reported on the root element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub inconclusive: u32,
    pub skipped: u32,
}

impl TestSummary {
    /// Sum of the per-category counts.
    pub fn category_sum(&self) -> u64 {
        [self.passed, self.failed, self.skipped, self.inconclusive]
            .into_iter()
            .map(u64::from)
            .sum()
    }

    pub fn sums_match(&self) -> bool {
        u64::from(self.total) == self.category_sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTest {
    pub name: String,
    pub message: String,
    pub stack_trace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResults {
    pub summary: TestSummary,
    pub failures: Vec<FailedTest>,
}

impl TestResults {
    /// Whether the results pass: no failures and consistent counts.
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.summary.sums_match()
    }

    /// Log failures and counts, recording result lines in `summary`.
    pub fn report(&self, summary: &mut RunLog) {
        if !self.failures.is_empty() {
            error!("Test failures found:");
            for (i, failure) in self.failures.iter().enumerate() {
                error!(
                    "  {}: {}\n  {}\n  {}\n",
                    i + 1,
                    failure.name,
                    failure.message,
                    failure.stack_trace
                );
            }
        }

        let s = &self.summary;
        summary.result_info("Test results:");
        summary.result_info(format!("  Total: {}", s.total));
        summary.result_info(format!("  Passed: {}", s.passed));
        summary.result_info(format!("  Failed: {}", s.failed));
        summary.result_info(format!("  Skipped: {}", s.skipped));
        summary.result_info(format!("  Inconclusive: {}", s.inconclusive));
        if s.total == 0 {
            summary.result_info("No tests were executed");
        }
        if !s.sums_match() {
            summary.result_error(format!(
                "Test result sums don't match. Total was reported as {} but the numbers add up to {}",
                s.total,
                s.category_sum()
            ));
        }
    }
}

pub fn parse_file(path: &Path) -> Result<TestResults, ResultsError> {
    let text = std::fs::read_to_string(path).map_err(|source| ResultsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&text)
}

pub fn parse(xml: &str) -> Result<TestResults, ResultsError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();

    let summary = TestSummary {
        total: count(root, "total")?,
        passed: count(root, "passed")?,
        failed: count(root, "failed")?,
        inconclusive: count(root, "inconclusive")?,
        skipped: count(root, "skipped")?,
    };

    let mut failures = Vec::new();
    for suite in root.children().filter(|n| n.has_tag_name("test-suite")) {
        collect_suite(suite, &mut failures);
    }

    Ok(TestResults { summary, failures })
}

fn count(node: Node<'_, '_>, name: &'static str) -> Result<u32, ResultsError> {
    let value = node
        .attribute(name)
        .ok_or(ResultsError::MissingCount(name))?;
    value.trim().parse().map_err(|_| ResultsError::BadCount {
        name,
        value: value.to_string(),
    })
}

fn collect_suite(suite: Node<'_, '_>, failures: &mut Vec<FailedTest>) {
    for child in suite.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "test-suite" => collect_suite(child, failures),
            "test-case" => collect_case(child, failures),
            _ => {}
        }
    }
}

fn collect_case(case: Node<'_, '_>, failures: &mut Vec<FailedTest>) {
    for failure in case.children().filter(|n| n.has_tag_name("failure")) {
        failures.push(FailedTest {
            name: case.attribute("fullname").unwrap_or_default().to_string(),
            message: child_text(failure, "message"),
            stack_trace: child_text(failure, "stack-trace"),
        });
    }
}

fn child_text(node: Node<'_, '_>, tag: &str) -> String {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .unwrap_or_default()
        .to_string()
}
