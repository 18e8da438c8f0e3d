//! Line classification rules for host application logs.
//!
//! Each host generation writes a different set of recognisable lines. A
//! [`RuleSet`] bundles the fixed signature tables for one generation, and
//! [`RuleSet::classify`] maps a single log line to a [`LineEvent`].
//!
//! Precedence is fixed:
//!
//! ```text
//! 1. "##utp:" prefix      → Protocol  (never falls through)
//! 2. failure signatures   → Failure
//! 3. instability patterns → Instability (retry, not fail)
//! 4. exit markers         → Exit
//! 5. compiler diagnostics → Diagnostic (legacy hosts only)
//! 6. anything else        → Inert
//! ```

use std::collections::VecDeque;

use crate::utp::UTP_PREFIX;

/// Default number of recent lines kept for crash diagnostics.
pub const DEFAULT_RECENT_LINES: usize = 20;

const CRASH_HANDLER_LINE: &str = "A crash has been intercepted by the crash handler. For call stack and other details, see the latest crash report generated in:";

const EDITOR_FAILURES: &[&str] = &[
    "Error building Player because scripts had compiler errors",
    "Failed to build player.",
    "Aborting batchmode due to failure:",
    "No tests were executed",
    "Scripts have compiler errors.",
    "Unhandled Exception: System.InvalidOperationException: C++ code builder is unable to build C++ code. In order to build C++ code for Windows Desktop, you must have one of these installed:",
    "Fatal Error! It looks like another Unity instance is running with this project open.",
    "Multiple Unity instances cannot open the same project.",
    "[Package Manager] An error occurred while resolving packages:",
];

const LEGACY_FAILURES: &[&str] = &[
    "Error building Player because scripts had compiler errors",
    "Failed to build player.",
    "Aborting batchmode due to failure:",
    "No tests were executed",
    "Scripts have compiler errors.",
    "Unhandled Exception: System.InvalidOperationException: C++ code builder is unable to build C++ code. In order to build C++ code for Windows Desktop, you must have one of these installed:",
    "Fatal Error! It looks like another Unity instance is running with this project open.",
    "Multiple Unity instances cannot open the same project.",
];

const EDITOR_FAILURE_PREFIXES: &[&str] = &[
    "DirectoryNotFoundException: Could not find a part of the path",
    "UnityException: ",
];

const LEGACY_FAILURE_PREFIXES: &[&str] =
    &["DirectoryNotFoundException: Could not find a part of the path"];

const PLAYER_FAILURE_PREFIXES: &[&str] = &["The referenced script on this Behaviour"];

const EDITOR_INSTABILITY: &[&str] = &[
    "connect ETIMEDOUT",
    "Cannot connect to registry",
    "failed to fetch from registry:",
    "Cannot connect to Unity Package Manager local server",
    ": 404 Not Found: artifactory",
];

const EDITOR_EXITS: &[&str] = &[
    "Cleanup mono",
    "Exiting batchmode successfully now!",
    "Aborting batchmode due to failure:",
];

const LEGACY_EXITS: &[&str] = &["Cleanup mono", "Exiting batchmode successfully now!"];

const EDITOR_EXIT_PREFIXES: &[&str] =
    &["Exiting without the bug reporter. Application will terminate with return code"];

/// Severity of a textual compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

/// Classification of a single log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// Nothing recognisable.
    Inert,
    /// Structured protocol line; carries the JSON payload after the prefix.
    Protocol(String),
    /// The host failed logically.
    Failure(String),
    /// Transient infrastructure trouble; the whole attempt should be retried.
    Instability(String),
    /// The host announced it is shutting down.
    Exit,
    /// Textual compiler warning/error line.
    Diagnostic { level: DiagnosticLevel, text: String },
}

/// Fixed signature tables for one host generation.
#[derive(Debug, Clone)]
pub struct RuleSet {
    name: &'static str,
    protocol: bool,
    failure_exact: &'static [&'static str],
    failure_prefixes: &'static [&'static str],
    exception_first_word: bool,
    crash_handler_is_failure: Option<bool>,
    instability: &'static [&'static str],
    exit_exact: &'static [&'static str],
    exit_prefixes: &'static [&'static str],
    require_exit_marker: bool,
    compiler_diagnostics: bool,
}

impl RuleSet {
    /// Editors new enough to emit the structured test protocol.
    pub fn modern() -> Self {
        Self {
            name: "modern",
            protocol: true,
            failure_exact: EDITOR_FAILURES,
            failure_prefixes: EDITOR_FAILURE_PREFIXES,
            exception_first_word: false,
            crash_handler_is_failure: None,
            instability: EDITOR_INSTABILITY,
            exit_exact: EDITOR_EXITS,
            exit_prefixes: EDITOR_EXIT_PREFIXES,
            require_exit_marker: true,
            compiler_diagnostics: false,
        }
    }

    /// Older editors: no protocol, no instability detection, textual
    /// compiler diagnostics instead.
    pub fn legacy() -> Self {
        Self {
            name: "legacy",
            protocol: false,
            failure_exact: LEGACY_FAILURES,
            failure_prefixes: LEGACY_FAILURE_PREFIXES,
            exception_first_word: false,
            crash_handler_is_failure: None,
            instability: &[],
            exit_exact: LEGACY_EXITS,
            exit_prefixes: &[],
            require_exit_marker: true,
            compiler_diagnostics: true,
        }
    }

    /// Built players. They print no shutdown marker, so a clean process exit
    /// is trusted. A crash-handler report only counts as failure when the
    /// run is expected to exit with 0.
    pub fn player(expected_exit_code: i32) -> Self {
        Self {
            name: "player",
            protocol: false,
            failure_exact: &[],
            failure_prefixes: PLAYER_FAILURE_PREFIXES,
            exception_first_word: true,
            crash_handler_is_failure: Some(expected_exit_code == 0),
            instability: &[],
            exit_exact: &[],
            exit_prefixes: &[],
            require_exit_marker: false,
            compiler_diagnostics: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn protocol_enabled(&self) -> bool {
        self.protocol
    }

    /// Whether a process exit without an exit marker counts as a crash.
    pub fn require_exit_marker(&self) -> bool {
        self.require_exit_marker
    }

    /// Whether a crash-handler line was seen but deliberately not treated as
    /// a failure (non-zero expected exit code).
    pub fn is_tolerated_crash(&self, line: &str) -> bool {
        self.crash_handler_is_failure == Some(false) && line == CRASH_HANDLER_LINE
    }

    /// Classify one line.
    pub fn classify(&self, line: &str) -> LineEvent {
        if line.is_empty() {
            return LineEvent::Inert;
        }

        if self.protocol {
            if let Some(payload) = line.strip_prefix(UTP_PREFIX) {
                return LineEvent::Protocol(payload.to_string());
            }
        }

        if self.is_failure(line) {
            return LineEvent::Failure(line.to_string());
        }

        if self.instability.iter().any(|s| line.contains(s)) {
            return LineEvent::Instability(line.to_string());
        }

        if self.is_exit_marker(line) {
            return LineEvent::Exit;
        }

        if self.compiler_diagnostics {
            if line.contains(": error CS") {
                return LineEvent::Diagnostic {
                    level: DiagnosticLevel::Error,
                    text: line.to_string(),
                };
            }
            if line.contains(": warning CS") {
                return LineEvent::Diagnostic {
                    level: DiagnosticLevel::Warning,
                    text: line.to_string(),
                };
            }
        }

        LineEvent::Inert
    }

    /// Exit-marker check on its own. Some failure lines double as exit
    /// markers, and classification reports them as failures first.
    pub fn is_exit_marker(&self, line: &str) -> bool {
        self.exit_exact.contains(&line) || self.exit_prefixes.iter().any(|p| line.starts_with(p))
    }

    fn is_failure(&self, line: &str) -> bool {
        if self.failure_exact.contains(&line) {
            return true;
        }
        if self.failure_prefixes.iter().any(|p| line.starts_with(p)) {
            return true;
        }
        if self.crash_handler_is_failure == Some(true) && line == CRASH_HANDLER_LINE {
            return true;
        }
        if self.exception_first_word {
            let first_word = line.split(' ').next().unwrap_or_default();
            if first_word.ends_with("Exception:") {
                return true;
            }
        }
        false
    }
}

/// Fixed-size ring of the most recent lines.
#[derive(Debug, Clone)]
pub struct RecentLines {
    lines: VecDeque<String>,
    max_size: usize,
}

impl RecentLines {
    pub fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Push a line, evicting the oldest if full.
    pub fn push(&mut self, line: &str) {
        if self.max_size == 0 {
            return;
        }
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Indented block for inclusion in a crash report.
    pub fn format_block(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_prefix_wins_over_everything() {
        let rules = RuleSet::modern();
        let line = r#"##utp:{"type":"LogEntry","message":"Cleanup mono"}"#;
        match rules.classify(line) {
            LineEvent::Protocol(payload) => assert!(payload.starts_with('{')),
            other => panic!("expected Protocol, got: {other:?}"),
        }
    }

    #[test]
    fn protocol_line_with_failure_text_does_not_fall_through() {
        let rules = RuleSet::modern();
        let line = "##utp:Failed to build player.";
        assert!(matches!(rules.classify(line), LineEvent::Protocol(_)));
    }

    #[test]
    fn legacy_treats_protocol_prefix_as_text() {
        let rules = RuleSet::legacy();
        assert_eq!(rules.classify(r#"##utp:{"type":"LogEntry"}"#), LineEvent::Inert);
    }

    #[test]
    fn exact_failure_signatures() {
        let rules = RuleSet::modern();
        for line in [
            "Failed to build player.",
            "Error building Player because scripts had compiler errors",
            "No tests were executed",
            "Multiple Unity instances cannot open the same project.",
        ] {
            assert!(
                matches!(rules.classify(line), LineEvent::Failure(_)),
                "expected failure for {line:?}"
            );
        }
    }

    #[test]
    fn failure_match_is_exact_not_substring() {
        let rules = RuleSet::modern();
        assert_eq!(
            rules.classify("  Failed to build player. (retrying)"),
            LineEvent::Inert
        );
    }

    #[test]
    fn failure_prefixes() {
        let rules = RuleSet::modern();
        assert!(matches!(
            rules.classify("DirectoryNotFoundException: Could not find a part of the path '/tmp/x'"),
            LineEvent::Failure(_)
        ));
        assert!(matches!(
            rules.classify("UnityException: Transform child out of bounds"),
            LineEvent::Failure(_)
        ));
    }

    #[test]
    fn legacy_lacks_newer_failure_rules() {
        let rules = RuleSet::legacy();
        assert_eq!(
            rules.classify("UnityException: Transform child out of bounds"),
            LineEvent::Inert
        );
        assert_eq!(
            rules.classify("[Package Manager] An error occurred while resolving packages:"),
            LineEvent::Inert
        );
    }

    #[test]
    fn instability_is_substring_match() {
        let rules = RuleSet::modern();
        let line = "npm ERR! request to https://packages.example failed, reason: connect ETIMEDOUT 10.0.0.1:443";
        assert!(matches!(rules.classify(line), LineEvent::Instability(_)));
        assert!(matches!(
            rules.classify("GET https://x/y: 404 Not Found: artifactory/api"),
            LineEvent::Instability(_)
        ));
    }

    #[test]
    fn legacy_has_no_instability_rules() {
        let rules = RuleSet::legacy();
        assert_eq!(rules.classify("Cannot connect to registry"), LineEvent::Inert);
    }

    #[test]
    fn exit_markers() {
        let rules = RuleSet::modern();
        assert_eq!(rules.classify("Cleanup mono"), LineEvent::Exit);
        assert_eq!(
            rules.classify("Exiting batchmode successfully now!"),
            LineEvent::Exit
        );
        assert_eq!(
            rules.classify(
                "Exiting without the bug reporter. Application will terminate with return code 0"
            ),
            LineEvent::Exit
        );
    }

    #[test]
    fn abort_line_is_failure_and_exit_marker() {
        let rules = RuleSet::modern();
        let line = "Aborting batchmode due to failure:";
        assert!(matches!(rules.classify(line), LineEvent::Failure(_)));
        assert!(rules.is_exit_marker(line));
    }

    #[test]
    fn legacy_exit_markers_are_reduced() {
        let rules = RuleSet::legacy();
        assert_eq!(rules.classify("Cleanup mono"), LineEvent::Exit);
        assert!(!rules.is_exit_marker(
            "Exiting without the bug reporter. Application will terminate with return code 0"
        ));
    }

    #[test]
    fn legacy_compiler_diagnostics() {
        let rules = RuleSet::legacy();
        assert_eq!(
            rules.classify("Assets/A.cs(3,1): error CS0246: type not found"),
            LineEvent::Diagnostic {
                level: DiagnosticLevel::Error,
                text: "Assets/A.cs(3,1): error CS0246: type not found".into(),
            }
        );
        assert!(matches!(
            rules.classify("Assets/A.cs(9,5): warning CS0168: unused variable"),
            LineEvent::Diagnostic {
                level: DiagnosticLevel::Warning,
                ..
            }
        ));
        assert_eq!(
            RuleSet::modern().classify("Assets/A.cs(3,1): error CS0246: type not found"),
            LineEvent::Inert
        );
    }

    #[test]
    fn player_exception_first_word() {
        let rules = RuleSet::player(0);
        assert!(matches!(
            rules.classify("NullReferenceException: Object reference not set"),
            LineEvent::Failure(_)
        ));
        assert_eq!(
            rules.classify("Caught NullReferenceException: handled"),
            LineEvent::Inert
        );
        assert!(!rules.require_exit_marker());
    }

    #[test]
    fn player_crash_handler_depends_on_expected_exit_code() {
        let strict = RuleSet::player(0);
        assert!(matches!(
            strict.classify(CRASH_HANDLER_LINE),
            LineEvent::Failure(_)
        ));
        assert!(!strict.is_tolerated_crash(CRASH_HANDLER_LINE));

        let lenient = RuleSet::player(3);
        assert_eq!(lenient.classify(CRASH_HANDLER_LINE), LineEvent::Inert);
        assert!(lenient.is_tolerated_crash(CRASH_HANDLER_LINE));
    }

    #[test]
    fn empty_line_is_inert() {
        assert_eq!(RuleSet::modern().classify(""), LineEvent::Inert);
    }

    #[test]
    fn recent_lines_evicts_oldest() {
        let mut recent = RecentLines::new(2);
        recent.push("a");
        recent.push("b");
        recent.push("c");
        assert_eq!(recent.snapshot(), vec!["b", "c"]);
        assert_eq!(recent.format_block(), "  b\n  c\n");
    }

    #[test]
    fn recent_lines_default_size_keeps_last_twenty() {
        let mut recent = RecentLines::new(DEFAULT_RECENT_LINES);
        for i in 0..30 {
            recent.push(&format!("line {i}"));
        }
        assert_eq!(recent.len(), 20);
        assert_eq!(recent.snapshot()[0], "line 10");
    }

    #[test]
    fn recent_lines_zero_capacity_keeps_nothing() {
        let mut recent = RecentLines::new(0);
        recent.push("a");
        assert!(recent.is_empty());
        assert_eq!(recent.capacity(), 0);
    }
}
