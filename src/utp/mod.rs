//! Decoder for the inline structured test protocol ("UTP").
//!
//! The host writes lines of the form `##utp:{json}` into its ordinary log.
//! Every payload carries a `type` discriminator and usually a `phase`
//! (`Begin`/`End`/`Immediate`). Key casing differs between host versions
//! (`Type` vs `type`), so top-level keys are normalised to camelCase before
//! the payload is decoded into its typed message.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Prefix that marks a structured protocol line.
pub const UTP_PREFIX: &str = "##utp:";

/// Why a protocol payload could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("protocol payload is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("protocol payload is not a JSON object")]
    NotAnObject,

    #[error("protocol payload has no type discriminator")]
    MissingType,

    #[error("unknown protocol message type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} message: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Message phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Phase {
    Begin,
    End,
    #[default]
    #[serde(other)]
    Immediate,
}

/// Log severity as written by the host. Anything other than `Info` and
/// `Warning` is treated as an error.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Severity {
    Info,
    Warning,
    Other(String),
}

impl From<String> for Severity {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Info" => Severity::Info,
            "Warning" => Severity::Warning,
            _ => Severity::Other(value),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("Info"),
            Severity::Warning => f.write_str("Warning"),
            Severity::Other(s) => f.write_str(s),
        }
    }
}

/// Final state of a test, numbered the way the host numbers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawTestState")]
pub enum TestState {
    Inconclusive,
    NotRunnable,
    Skipped,
    Ignored,
    Success,
    Failure,
    Error,
    Cancelled,
}

impl TestState {
    pub fn is_failed(self) -> bool {
        matches!(self, TestState::Failure | TestState::Error)
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestState::Inconclusive => "Inconclusive",
            TestState::NotRunnable => "NotRunnable",
            TestState::Skipped => "Skipped",
            TestState::Ignored => "Ignored",
            TestState::Success => "Success",
            TestState::Failure => "Failure",
            TestState::Error => "Error",
            TestState::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTestState {
    Code(u8),
    Name(String),
}

impl TryFrom<RawTestState> for TestState {
    type Error = String;

    fn try_from(raw: RawTestState) -> Result<TestState, String> {
        let state = match raw {
            RawTestState::Code(0) => TestState::Inconclusive,
            RawTestState::Code(1) => TestState::NotRunnable,
            RawTestState::Code(2) => TestState::Skipped,
            RawTestState::Code(3) => TestState::Ignored,
            RawTestState::Code(4) => TestState::Success,
            RawTestState::Code(5) => TestState::Failure,
            RawTestState::Code(6) => TestState::Error,
            RawTestState::Code(7) => TestState::Cancelled,
            RawTestState::Code(n) => return Err(format!("unknown test state code {n}")),
            RawTestState::Name(name) => match name.as_str() {
                "Inconclusive" => TestState::Inconclusive,
                "NotRunnable" => TestState::NotRunnable,
                "Skipped" => TestState::Skipped,
                "Ignored" => TestState::Ignored,
                "Success" => TestState::Success,
                "Failure" => TestState::Failure,
                "Error" => TestState::Error,
                "Cancelled" => TestState::Cancelled,
                _ => return Err(format!("unknown test state {name:?}")),
            },
        };
        Ok(state)
    }
}

/// A log call made by the host (or by code under test).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stacktrace: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub time: i64,
}

impl LogEntry {
    /// Emission time (milliseconds since the epoch), if the host sent one.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        if self.time <= 0 {
            return None;
        }
        DateTime::from_timestamp_millis(self.time)
    }

    /// `time severity: message (file:line)` rendering used in failure reports.
    pub fn render(&self) -> String {
        let time = self
            .timestamp()
            .map(|t| t.format("%H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| "--:--:--.---".to_string());
        format!(
            "{time} {}: {} ({}:{})",
            self.severity, self.message, self.file, self.line
        )
    }
}

/// Start of a test run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPlan {
    #[serde(default)]
    pub tests: Vec<String>,
}

impl TestPlan {
    pub fn test_count(&self) -> usize {
        self.tests.len()
    }
}

/// Begin/end of one test.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatus {
    pub phase: Phase,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: Option<TestState>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
}

/// Compilation failure batch for one assembly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyCompilationErrors {
    #[serde(default)]
    pub assembly: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Named host action (import, build, ...).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum UtpMessage {
    LogEntry(LogEntry),
    TestPlan(TestPlan),
    TestStatus(TestStatus),
    AssemblyCompilationErrors(AssemblyCompilationErrors),
    Action(Action),
}

/// Decode the payload that follows [`UTP_PREFIX`].
pub fn decode(payload: &str) -> Result<UtpMessage, DecodeError> {
    let value: Value = serde_json::from_str(payload.trim()).map_err(DecodeError::Json)?;
    let Value::Object(map) = value else {
        return Err(DecodeError::NotAnObject);
    };
    let map = camel_case_keys(map);

    let kind = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();
    let value = Value::Object(map);

    let message = match kind.as_str() {
        "LogEntry" => UtpMessage::LogEntry(payload_as(value, "LogEntry")?),
        "TestPlan" => UtpMessage::TestPlan(payload_as(value, "TestPlan")?),
        "TestStatus" => UtpMessage::TestStatus(payload_as(value, "TestStatus")?),
        "AssemblyCompilationErrors" => {
            UtpMessage::AssemblyCompilationErrors(payload_as(value, "AssemblyCompilationErrors")?)
        }
        "Action" => UtpMessage::Action(payload_as(value, "Action")?),
        _ => return Err(DecodeError::UnknownType(kind)),
    };
    Ok(message)
}

/// Decode a full log line, if it carries the protocol prefix.
pub fn decode_line(line: &str) -> Option<Result<UtpMessage, DecodeError>> {
    line.strip_prefix(UTP_PREFIX).map(decode)
}

fn payload_as<T: for<'de> Deserialize<'de>>(
    value: Value,
    kind: &'static str,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Payload { kind, source })
}

fn camel_case_keys(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let mut chars = key.chars();
            let key = match chars.next() {
                Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
                None => key,
            };
            (key, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_log_entry() {
        let msg = decode(
            r#"{"type":"LogEntry","version":2,"phase":"Immediate","time":1700000000123,"processId":42,"severity":"Warning","message":"Shader warning","stacktrace":"at X","file":"Assets/S.shader","line":12}"#,
        )
        .unwrap();
        match msg {
            UtpMessage::LogEntry(entry) => {
                assert_eq!(entry.severity, Severity::Warning);
                assert_eq!(entry.message, "Shader warning");
                assert_eq!(entry.stacktrace, "at X");
                assert_eq!(entry.file, "Assets/S.shader");
                assert_eq!(entry.line, 12);
                assert!(entry.timestamp().is_some());
            }
            other => panic!("expected LogEntry, got: {other:?}"),
        }
    }

    #[test]
    fn only_info_is_informational() {
        assert_eq!(Severity::from("Info".to_string()), Severity::Info);
        assert_eq!(Severity::from("Warning".to_string()), Severity::Warning);
        assert_eq!(
            Severity::from("Log".to_string()),
            Severity::Other("Log".into())
        );
    }

    #[test]
    fn accepts_pascal_case_keys() {
        let msg = decode(r#"{"Type":"LogEntry","Severity":"Error","Message":"boom"}"#).unwrap();
        match msg {
            UtpMessage::LogEntry(entry) => {
                assert_eq!(entry.severity, Severity::Other("Error".into()));
                assert_eq!(entry.message, "boom");
            }
            other => panic!("expected LogEntry, got: {other:?}"),
        }
    }

    #[test]
    fn decodes_test_status_with_numeric_state() {
        let msg = decode(
            r#"{"type":"TestStatus","phase":"End","name":"Suite.Case","state":5,"message":"Expected 1 but was 2","duration":17}"#,
        )
        .unwrap();
        match msg {
            UtpMessage::TestStatus(status) => {
                assert_eq!(status.phase, Phase::End);
                assert_eq!(status.name, "Suite.Case");
                assert_eq!(status.state, Some(TestState::Failure));
                assert!(status.state.unwrap().is_failed());
                assert_eq!(status.message.as_deref(), Some("Expected 1 but was 2"));
            }
            other => panic!("expected TestStatus, got: {other:?}"),
        }
    }

    #[test]
    fn decodes_test_status_with_named_state() {
        let msg =
            decode(r#"{"type":"TestStatus","phase":"End","name":"T","state":"Success"}"#).unwrap();
        assert!(matches!(
            msg,
            UtpMessage::TestStatus(TestStatus {
                state: Some(TestState::Success),
                ..
            })
        ));
    }

    #[test]
    fn test_begin_has_no_state() {
        let msg = decode(r#"{"type":"TestStatus","phase":"Begin","name":"T"}"#).unwrap();
        match msg {
            UtpMessage::TestStatus(status) => {
                assert_eq!(status.phase, Phase::Begin);
                assert_eq!(status.state, None);
            }
            other => panic!("expected TestStatus, got: {other:?}"),
        }
    }

    #[test]
    fn decodes_test_plan() {
        let msg = decode(r#"{"type":"TestPlan","tests":["A.a","A.b","B.c"]}"#).unwrap();
        match msg {
            UtpMessage::TestPlan(plan) => assert_eq!(plan.test_count(), 3),
            other => panic!("expected TestPlan, got: {other:?}"),
        }
    }

    #[test]
    fn decodes_compilation_errors() {
        let msg = decode(
            r#"{"type":"AssemblyCompilationErrors","assembly":"Assembly-CSharp","errors":["A.cs(1,1): error CS1","B.cs(2,2): error CS2"]}"#,
        )
        .unwrap();
        match msg {
            UtpMessage::AssemblyCompilationErrors(batch) => {
                assert_eq!(batch.assembly, "Assembly-CSharp");
                assert_eq!(batch.errors.len(), 2);
            }
            other => panic!("expected AssemblyCompilationErrors, got: {other:?}"),
        }
    }

    #[test]
    fn decodes_action_without_errors() {
        let msg = decode(r#"{"type":"Action","phase":"Begin","name":"Build"}"#).unwrap();
        match msg {
            UtpMessage::Action(action) => {
                assert_eq!(action.phase, Phase::Begin);
                assert!(action.errors.is_empty());
            }
            other => panic!("expected Action, got: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = decode(r#"{"type":"MemoryLeaks","phase":"Immediate"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(ref t) if t == "MemoryLeaks"));
        assert!(err.to_string().contains("MemoryLeaks"));
    }

    #[test]
    fn malformed_payloads_are_errors_not_panics() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode("[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(
            decode(r#"{"phase":"End"}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            decode(r#"{"type":"LogEntry","message":"no severity"}"#),
            Err(DecodeError::Payload {
                kind: "LogEntry",
                ..
            })
        ));
        assert!(matches!(
            decode(r#"{"type":"TestStatus","phase":"End","state":42}"#),
            Err(DecodeError::Payload { .. })
        ));
    }

    #[test]
    fn unknown_phase_is_immediate() {
        let msg = decode(r#"{"type":"Action","phase":"Sideways","name":"x"}"#).unwrap();
        assert!(matches!(
            msg,
            UtpMessage::Action(Action {
                phase: Phase::Immediate,
                ..
            })
        ));
    }

    #[test]
    fn decode_line_requires_prefix() {
        assert!(decode_line("plain text").is_none());
        let decoded = decode_line(r#"##utp:{"type":"TestPlan","tests":[]}"#).unwrap();
        assert!(decoded.is_ok());
    }

    #[test]
    fn render_includes_location() {
        let entry = LogEntry {
            severity: Severity::Other("Exception".into()),
            message: "NullReferenceException".into(),
            stacktrace: String::new(),
            file: "Assets/Foo.cs".into(),
            line: 33,
            time: 0,
        };
        let rendered = entry.render();
        assert!(rendered.contains("Exception: NullReferenceException"));
        assert!(rendered.ends_with("(Assets/Foo.cs:33)"));
        assert!(rendered.starts_with("--:--:--.---"));
    }
}
