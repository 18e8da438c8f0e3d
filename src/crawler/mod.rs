//! Termination state machine for one run attempt.
//!
//! The crawler pulls lines from the log tail, classifies them, feeds
//! protocol messages to the test-session tracker, and decides when the host
//! is done. The host's exit code alone is not trusted: a run can hang after
//! finishing, crash without a word, or report failure and exit with 0.
//!
//! ## State machine
//!
//! ```text
//! RUNNING        → line read          → classify, maybe start countdown
//!                → no data, alive     → sleep (active / missing poll)
//!                → process exited     → drain, then resolve
//! AWAITING_DEATH → process exited     → drain, then resolve
//!                → countdown expired  → kill, resolve
//! any            → deadline passed    → kill, resolve
//! ```
//!
//! Each call to [`Crawler::step`] does one unit of work and returns how
//! long the caller should sleep before the next call.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::findings::{DEFAULT_DISPLAY_LIMIT, Findings};
use crate::log::{RunLog, TimingsLog};
use crate::rules::{DEFAULT_RECENT_LINES, DiagnosticLevel, LineEvent, RecentLines, RuleSet};
use crate::session::TestSessions;
use crate::tail::{LineRead, LogTail};
use crate::utp::{self, LogEntry, Phase, Severity, UtpMessage};
use crate::version::{DEFAULT_SCAN_LINES, GateDecision, VersionGate};

/// The supervised process, as far as the crawler needs it.
pub trait ChildProcess {
    fn id(&self) -> u32;
    /// Non-blocking liveness poll.
    fn has_exited(&mut self) -> Result<bool>;
    fn kill(&mut self) -> Result<()>;
}

impl ChildProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn has_exited(&mut self) -> Result<bool> {
        Ok(self.try_wait()?.is_some())
    }

    fn kill(&mut self) -> Result<()> {
        match Child::kill(self) {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// How a crawl ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Judge the run by the process exit code.
    UseExitCode,
    /// The process was killed after finishing; its exit code is meaningless.
    IgnoreExitCode,
    /// Transient instability; run the whole attempt again.
    Retry,
    /// The run failed regardless of exit code.
    FailedRun,
}

/// Crawler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    Running,
    /// An exit marker was seen; waiting for the process to go away.
    AwaitingDeath { ticks_left: u32 },
    Resolved(Resolution),
}

/// What the caller should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Sleep this long, then step again.
    Continue(Duration),
    Resolved(Resolution),
}

/// Independently toggleable verdict policies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policies {
    /// Any warning fails the run.
    pub treat_warnings_as_failures: bool,
    /// A wall-clock timeout kills the host but does not fail the run.
    pub timeout_is_not_fatal: bool,
    /// In-test warnings and errors also go to the run-wide lists.
    pub escalate_in_test_errors: bool,
    /// Logged errors do not fail the run if the expected artifact exists.
    pub accept_errors_with_artifact: bool,
}

/// Polling and buffering knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlerSettings {
    /// Sleep when the log exists but has nothing new.
    pub active_poll: Duration,
    /// Sleep when the log does not exist yet or is locked.
    pub missing_poll: Duration,
    /// Countdown length after an exit marker.
    pub death_ticks: u32,
    pub death_tick: Duration,
    /// Lines kept for the crash diagnostic.
    pub recent_lines: usize,
    /// Lines scanned for a host version before defaulting.
    pub version_scan_lines: usize,
    /// Write `<log>.timings.log`.
    pub timings_log: bool,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            active_poll: Duration::from_millis(10),
            missing_poll: Duration::from_secs(1),
            death_ticks: 10,
            death_tick: Duration::from_secs(1),
            recent_lines: DEFAULT_RECENT_LINES,
            version_scan_lines: DEFAULT_SCAN_LINES,
            timings_log: true,
        }
    }
}

/// How the rule set is chosen.
#[derive(Debug, Clone)]
pub enum RuleSelection {
    /// Detect the host version from the first log lines.
    Auto,
    Fixed(RuleSet),
}

/// State that outlives a single attempt: findings and the run summary.
#[derive(Debug)]
pub struct RunReport {
    pub findings: Findings,
    pub summary: RunLog,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new(DEFAULT_DISPLAY_LIMIT)
    }
}

impl RunReport {
    pub fn new(display_limit: usize) -> Self {
        Self {
            findings: Findings::new(display_limit),
            summary: RunLog::new(),
        }
    }
}

/// Summary of one finished crawl.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlReport {
    pub resolution: Resolution,
    pub timed_out: bool,
    pub failure_seen: bool,
    pub instability_seen: bool,
    pub exit_marker_seen: bool,
    /// Last lines before an undiagnosed crash.
    pub crash_lines: Option<Vec<String>>,
    /// Name of the rule set that was applied.
    pub rules: &'static str,
}

/// Termination state machine over one attempt's log.
pub struct Crawler {
    tail: LogTail,
    gate: Option<VersionGate>,
    rules: Option<RuleSet>,
    sessions: TestSessions,
    recent: RecentLines,
    timings: Option<TimingsLog>,
    settings: CrawlerSettings,
    policies: Policies,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    state: CrawlState,
    failure_seen: bool,
    instability_seen: bool,
    exit_marker_seen: bool,
    timed_out: bool,
    crash_lines: Option<Vec<String>>,
}

impl Crawler {
    pub fn new(
        log_file: &Path,
        selection: RuleSelection,
        settings: CrawlerSettings,
        policies: Policies,
        timeout: Option<Duration>,
    ) -> Self {
        let (gate, rules) = match selection {
            RuleSelection::Auto => (Some(VersionGate::new(settings.version_scan_lines.max(1))), None),
            RuleSelection::Fixed(rules) => (None, Some(rules)),
        };

        let timings = if settings.timings_log {
            match TimingsLog::create(log_file) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(error = %e, "timings log disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            tail: LogTail::new(log_file),
            gate,
            rules,
            sessions: TestSessions::new(),
            recent: RecentLines::new(settings.recent_lines),
            timings,
            settings,
            policies,
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            state: CrawlState::Running,
            failure_seen: false,
            instability_seen: false,
            exit_marker_seen: false,
            timed_out: false,
            crash_lines: None,
        }
    }

    pub fn state(&self) -> CrawlState {
        self.state
    }

    pub fn sessions(&self) -> &TestSessions {
        &self.sessions
    }

    /// Drive the state machine to a resolution, sleeping between steps.
    pub fn run(mut self, child: &mut dyn ChildProcess, report: &mut RunReport) -> CrawlReport {
        debug!(pid = child.id(), log = %self.tail.path().display(), "crawling log");
        let resolution = loop {
            match self.step(child, report) {
                Step::Continue(pause) => {
                    if !pause.is_zero() {
                        thread::sleep(pause);
                    }
                }
                Step::Resolved(resolution) => break resolution,
            }
        };

        CrawlReport {
            resolution,
            timed_out: self.timed_out,
            failure_seen: self.failure_seen,
            instability_seen: self.instability_seen,
            exit_marker_seen: self.exit_marker_seen,
            crash_lines: self.crash_lines.take(),
            rules: self.rules.as_ref().map(RuleSet::name).unwrap_or("undecided"),
        }
    }

    /// One unit of work.
    pub fn step(&mut self, child: &mut dyn ChildProcess, report: &mut RunReport) -> Step {
        if let CrawlState::Resolved(resolution) = self.state {
            return Step::Resolved(resolution);
        }

        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return self.on_timeout(child, report);
        }

        match self.state {
            CrawlState::Running => self.step_running(child, report),
            CrawlState::AwaitingDeath { ticks_left } => {
                self.step_awaiting_death(ticks_left, child, report)
            }
            CrawlState::Resolved(resolution) => Step::Resolved(resolution),
        }
    }

    fn step_running(&mut self, child: &mut dyn ChildProcess, report: &mut RunReport) -> Step {
        let idle = match self.tail.next_line() {
            LineRead::Line(line) => {
                self.consume(line, report);
                return Step::Continue(Duration::ZERO);
            }
            LineRead::NoData => self.settings.active_poll,
            LineRead::Unavailable => self.settings.missing_poll,
        };

        match child.has_exited() {
            Ok(true) => self.on_process_exit(report),
            Ok(false) => Step::Continue(idle),
            Err(e) => self.on_liveness_error(e, child, report),
        }
    }

    fn step_awaiting_death(
        &mut self,
        ticks_left: u32,
        child: &mut dyn ChildProcess,
        report: &mut RunReport,
    ) -> Step {
        while let LineRead::Line(line) = self.tail.next_line() {
            self.consume(line, report);
        }

        match child.has_exited() {
            Ok(true) => return self.on_process_exit(report),
            Ok(false) => {}
            Err(e) => return self.on_liveness_error(e, child, report),
        }

        if ticks_left > 0 {
            self.state = CrawlState::AwaitingDeath {
                ticks_left: ticks_left - 1,
            };
            return Step::Continue(self.settings.death_tick);
        }

        let waited = self.settings.death_tick * self.settings.death_ticks;
        if let Err(e) = child.kill() {
            warn!(pid = child.id(), error = %e, "failed to kill process");
        }

        let resolution = if self.instability_seen {
            error!(
                "Process did not quit after {:.1}s and instability was seen. Forcibly quitting and retrying",
                waited.as_secs_f64()
            );
            Resolution::Retry
        } else if self.failure_seen {
            report.summary.result_error(format!(
                "Process did not quit after {:.1}s and a log failure message was detected. Forcibly quitting, flagging run as failed.",
                waited.as_secs_f64()
            ));
            Resolution::FailedRun
        } else {
            warn!(
                "Process did not quit after {:.1}s. Forcibly quitting and ignoring its exit code",
                waited.as_secs_f64()
            );
            Resolution::IgnoreExitCode
        };
        self.resolve(resolution, report)
    }

    fn on_timeout(&mut self, child: &mut dyn ChildProcess, report: &mut RunReport) -> Step {
        self.timed_out = true;
        if let Err(e) = child.kill() {
            warn!(pid = child.id(), error = %e, "failed to kill timed out process");
        }

        let secs = self.timeout.unwrap_or_default().as_secs_f64();
        let resolution = if self.policies.timeout_is_not_fatal {
            report.summary.result_info(format!(
                "Execution timed out after {secs:.0} seconds. Timeouts are not fatal, ignoring exit code"
            ));
            Resolution::IgnoreExitCode
        } else {
            report
                .summary
                .result_error(format!("Execution timed out after {secs:.0} seconds. Failing run"));
            Resolution::FailedRun
        };
        self.resolve(resolution, report)
    }

    fn on_liveness_error(
        &mut self,
        e: anyhow::Error,
        child: &mut dyn ChildProcess,
        report: &mut RunReport,
    ) -> Step {
        if let Err(kill_err) = child.kill() {
            warn!(pid = child.id(), error = %kill_err, "failed to kill process");
        }
        report
            .summary
            .result_error(format!("Lost track of the process: {e:#}. Failing run"));
        self.resolve(Resolution::FailedRun, report)
    }

    fn on_process_exit(&mut self, report: &mut RunReport) -> Step {
        match self.tail.drain_remaining() {
            Ok(lines) => {
                for line in lines {
                    self.consume(line, report);
                }
            }
            Err(e) => warn!(error = %e, "failed to drain log after exit"),
        }
        if let Some(mut gate) = self.gate.take() {
            let decision = gate.finish();
            self.apply_decision(decision, report);
        }

        let require_marker = self
            .rules
            .as_ref()
            .is_none_or(RuleSet::require_exit_marker);

        let resolution = if self.instability_seen {
            error!("The process has exited, but an instability message was found, retrying.");
            Resolution::Retry
        } else if self.failure_seen {
            report.summary.result_error(
                "The process has exited, but a log failure message was detected, flagging run as failed.",
            );
            Resolution::FailedRun
        } else if self.exit_marker_seen || !require_marker {
            Resolution::UseExitCode
        } else {
            let lines = self.recent.snapshot();
            report.summary.result_error(format!(
                "The process exited without a recognised exit marker. Last {} lines of the log:\n{}",
                lines.len(),
                self.recent.format_block()
            ));
            self.crash_lines = Some(lines);
            Resolution::FailedRun
        };
        self.resolve(resolution, report)
    }

    fn resolve(&mut self, resolution: Resolution, report: &mut RunReport) -> Step {
        report.findings.flush(&mut report.summary);
        if let Some(timings) = self.timings.as_mut() {
            timings.flush();
        }
        debug!(?resolution, "crawl resolved");
        self.state = CrawlState::Resolved(resolution);
        Step::Resolved(resolution)
    }

    fn consume(&mut self, line: String, report: &mut RunReport) {
        if let Some(timings) = self.timings.as_mut() {
            timings.record(&line);
        }

        if let Some(gate) = self.gate.as_mut() {
            if let Some(decision) = gate.offer(line) {
                self.gate = None;
                self.apply_decision(decision, report);
            }
            return;
        }

        self.process_line(&line, report);
    }

    fn apply_decision(&mut self, decision: GateDecision, report: &mut RunReport) {
        self.rules = Some(decision.rules);
        for line in decision.replay {
            self.process_line(&line, report);
        }
    }

    fn process_line(&mut self, line: &str, report: &mut RunReport) {
        let Some(rules) = self.rules.as_ref() else {
            return;
        };
        let event = rules.classify(line);
        let is_exit = rules.is_exit_marker(line);
        let tolerated_crash = rules.is_tolerated_crash(line);

        self.recent.push(line);

        match event {
            LineEvent::Inert => {
                if tolerated_crash {
                    warn!("Crash handler report in the log; expected exit code is non-zero, not failing");
                }
            }
            LineEvent::Protocol(payload) => self.on_protocol(&payload, report),
            LineEvent::Failure(text) => {
                self.failure_seen = true;
                error!("Failure message in the log: {text}");
            }
            LineEvent::Instability(text) => {
                self.instability_seen = true;
                error!("Instability message in the log: {text}");
            }
            LineEvent::Exit => {}
            LineEvent::Diagnostic { level, text } => match level {
                DiagnosticLevel::Warning => report.findings.warning(text),
                DiagnosticLevel::Error => report.findings.error(text),
            },
        }

        if is_exit && self.state == CrawlState::Running {
            self.exit_marker_seen = true;
            info!("Exit marker found: {line}");
            self.state = CrawlState::AwaitingDeath {
                ticks_left: self.settings.death_ticks,
            };
        }
    }

    fn on_protocol(&mut self, payload: &str, report: &mut RunReport) {
        let message = match utp::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                error!("Unrecognised protocol message: {e}");
                return;
            }
        };

        match message {
            UtpMessage::LogEntry(entry) => {
                if self.policies.escalate_in_test_errors && self.sessions.in_test() {
                    record_entry(&entry, report);
                }
                if let Some(entry) = self.sessions.capture(entry) {
                    record_entry(&entry, report);
                }
            }
            UtpMessage::TestPlan(plan) => self.sessions.plan(&plan),
            UtpMessage::TestStatus(status) => match status.phase {
                Phase::Begin => self.sessions.begin(&status.name),
                Phase::End => {
                    if let Some(failure) = self.sessions.end(&status) {
                        let rendered = failure.render();
                        error!("{rendered}");
                        report.findings.error(rendered);
                    }
                }
                Phase::Immediate => debug!(test = %status.name, "test status without phase"),
            },
            UtpMessage::AssemblyCompilationErrors(batch) => {
                let mut text = format!(
                    "AssemblyCompilationErrors found {} errors in {}:",
                    batch.errors.len(),
                    batch.assembly
                );
                for e in &batch.errors {
                    text.push('\n');
                    text.push_str(e);
                }
                error!("{text}");
                report.findings.error(text);
            }
            UtpMessage::Action(action) => match action.phase {
                Phase::Begin => info!("Action {}: Started", action.name),
                Phase::End => {
                    info!("Action {}: Ended", action.name);
                    if !action.errors.is_empty() {
                        let mut text = format!(
                            "Action {} ended with {} errors:",
                            action.name,
                            action.errors.len()
                        );
                        for e in &action.errors {
                            text.push('\n');
                            text.push_str(e);
                        }
                        error!("{text}");
                        report.findings.error(text);
                    }
                }
                Phase::Immediate => debug!(action = %action.name, "action"),
            },
        }
    }
}

fn record_entry(entry: &LogEntry, report: &mut RunReport) {
    match &entry.severity {
        Severity::Info => {}
        Severity::Warning => report
            .findings
            .warning(join_trace(&entry.message, &entry.stacktrace)),
        other => report.findings.error(join_trace(
            &format!("{other}: {}", entry.message),
            &entry.stacktrace,
        )),
    }
}

fn join_trace(message: &str, stacktrace: &str) -> String {
    if stacktrace.trim().is_empty() {
        message.to_string()
    } else {
        format!("{message}\n{}", stacktrace.trim_end())
    }
}
