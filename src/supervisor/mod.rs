//! Process supervision with bounded retries.
//!
//! Each attempt deletes the previous log, spawns the host, crawls its log to
//! a resolution and reaps the process. A `Retry` resolution re-spawns after a
//! fixed backoff until the retry budget runs out. Nothing here returns an
//! error: every failure maps to a [`RunVerdict`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::crawler::{
    CrawlReport, Crawler, CrawlerSettings, Policies, Resolution, RuleSelection, RunReport,
};

/// Terminal outcome of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    Success,
    Failure,
    TimedOut,
    /// The host could not be started. Never retried.
    FailedToStart,
}

impl RunVerdict {
    pub fn is_success(self) -> bool {
        self == RunVerdict::Success
    }

    /// Process exit status for the launcher itself.
    pub fn exit_code(self) -> i32 {
        match self {
            RunVerdict::Success => 0,
            RunVerdict::Failure | RunVerdict::TimedOut => 1,
            RunVerdict::FailedToStart => 2,
        }
    }
}

/// Everything needed to run the host.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub log_file: PathBuf,
    pub expected_exit_code: i32,
    pub timeout: Option<Duration>,
    /// Re-spawns allowed after instability.
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub delete_attempts: u32,
    pub delete_backoff: Duration,
    pub rules: RuleSelection,
    pub crawler: CrawlerSettings,
    pub policies: Policies,
    /// Build output whose presence can excuse logged errors.
    pub expected_artifact: Option<PathBuf>,
}

impl LaunchConfig {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, log_file: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            work_dir: None,
            log_file: log_file.into(),
            expected_exit_code: 0,
            timeout: None,
            retry_limit: 50,
            retry_backoff: Duration::from_secs(30),
            delete_attempts: 50,
            delete_backoff: Duration::from_secs(10),
            rules: RuleSelection::Auto,
            crawler: CrawlerSettings::default(),
            policies: Policies::default(),
            expected_artifact: None,
        }
    }
}

/// Result of [`run`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub verdict: RunVerdict,
    /// Exit code of the last attempt, if it exited normally.
    pub exit_code: Option<i32>,
    pub attempts: u32,
    /// Resolution of the last crawl, if one ran.
    pub resolution: Option<Resolution>,
    pub elapsed: Duration,
}

/// Run the host until a terminal verdict is reached.
pub fn run(config: &LaunchConfig, report: &mut RunReport) -> RunOutcome {
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;

        if let Err(e) = delete_log(&config.log_file, config.delete_attempts, config.delete_backoff)
        {
            report.summary.result_error(format!("{e:#}"));
            return finish(started, RunVerdict::FailedToStart, None, attempts, None, report);
        }

        let mut child = match spawn(config) {
            Ok(child) => child,
            Err(e) => {
                report.summary.result_error(format!("{e:#}"));
                return finish(started, RunVerdict::FailedToStart, None, attempts, None, report);
            }
        };
        info!(
            pid = child.id(),
            attempt = attempts,
            "started {}",
            config.program.display()
        );

        let crawler = Crawler::new(
            &config.log_file,
            config.rules.clone(),
            config.crawler.clone(),
            config.policies.clone(),
            config.timeout,
        );
        let crawl = crawler.run(&mut child, report);
        let exit_code = reap(&mut child);
        debug!(resolution = ?crawl.resolution, ?exit_code, "attempt finished");

        if crawl.resolution == Resolution::Retry {
            let retries_used = attempts - 1;
            if retries_used < config.retry_limit {
                warn!(
                    attempt = attempts,
                    backoff_secs = config.retry_backoff.as_secs_f64(),
                    "instability detected, retrying"
                );
                report.summary.result_info(format!(
                    "Attempt {attempts} hit an instability, retrying"
                ));
                thread::sleep(config.retry_backoff);
                continue;
            }
            report.summary.result_error(format!(
                "Retry budget exhausted after {attempts} attempts, failing run"
            ));
            return finish(
                started,
                RunVerdict::Failure,
                exit_code,
                attempts,
                Some(crawl.resolution),
                report,
            );
        }

        let verdict = derive_verdict(config, &crawl, exit_code, report);
        return finish(
            started,
            verdict,
            exit_code,
            attempts,
            Some(crawl.resolution),
            report,
        );
    }
}

fn finish(
    started: Instant,
    verdict: RunVerdict,
    exit_code: Option<i32>,
    attempts: u32,
    resolution: Option<Resolution>,
    report: &mut RunReport,
) -> RunOutcome {
    let elapsed = started.elapsed();
    report
        .summary
        .result_info(format!("Command execution took: {:.1}s", elapsed.as_secs_f64()));
    RunOutcome {
        verdict,
        exit_code,
        attempts,
        resolution,
        elapsed,
    }
}

fn derive_verdict(
    config: &LaunchConfig,
    crawl: &CrawlReport,
    exit_code: Option<i32>,
    report: &mut RunReport,
) -> RunVerdict {
    if crawl.resolution == Resolution::FailedRun {
        return if crawl.timed_out {
            RunVerdict::TimedOut
        } else {
            RunVerdict::Failure
        };
    }

    if report.findings.has_errors() {
        let excused = config.policies.accept_errors_with_artifact
            && config.expected_artifact.as_deref().is_some_and(Path::exists);
        if excused {
            report
                .summary
                .result_info("Errors were logged, but the expected artifact exists. Ignoring them");
        } else {
            report
                .summary
                .result_error("Errors were logged, flagging run as failed");
            return RunVerdict::Failure;
        }
    }

    if config.policies.treat_warnings_as_failures && report.findings.has_warnings() {
        report.summary.result_error(
            "Warnings are treated as failures, marking the run as failed due to warnings",
        );
        return RunVerdict::Failure;
    }

    match crawl.resolution {
        Resolution::IgnoreExitCode => RunVerdict::Success,
        _ if exit_code == Some(config.expected_exit_code) => RunVerdict::Success,
        _ => {
            let observed = exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none (killed by signal)".to_string());
            report.summary.result_error(format!(
                "Exit code {observed} does not match expected exit code {}",
                config.expected_exit_code
            ));
            RunVerdict::Failure
        }
    }
}

/// Remove the log file, retrying while the previous writer still holds it.
pub fn delete_log(path: &Path, attempts: u32, backoff: Duration) -> Result<()> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "deleted previous log");
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt < attempts => {
                debug!(path = %path.display(), attempt, error = %e, "log still in use");
                thread::sleep(backoff);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "failed to delete log file {} after {attempts} attempts",
                        path.display()
                    )
                });
            }
        }
    }
    Ok(())
}

fn spawn(config: &LaunchConfig) -> Result<Child> {
    if let Some(parent) = config.log_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create log directory: {}", parent.display())
            })?;
        }
    }

    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = &config.work_dir {
        cmd.current_dir(dir);
    }

    debug!(program = %config.program.display(), args = ?config.args, "spawning host");
    cmd.spawn()
        .with_context(|| format!("failed to start {}", config.program.display()))
}

fn reap(child: &mut Child) -> Option<i32> {
    match child.wait() {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid = child.id(), error = %e, "failed to wait for process");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::rules::RuleSet;

    fn fast_config(dir: &Path, script: &str) -> LaunchConfig {
        let log = dir.join("Editor.log");
        let mut config = LaunchConfig::new(
            "sh",
            vec!["-c".to_string(), script.replace("$LOG", &log.display().to_string())],
            log,
        );
        config.rules = RuleSelection::Fixed(RuleSet::modern());
        config.retry_backoff = Duration::from_millis(1);
        config.delete_backoff = Duration::from_millis(1);
        config.delete_attempts = 2;
        config.crawler = CrawlerSettings {
            active_poll: Duration::from_millis(2),
            missing_poll: Duration::from_millis(2),
            death_ticks: 200,
            death_tick: Duration::from_millis(5),
            recent_lines: 20,
            version_scan_lines: 64,
            timings_log: false,
        };
        config
    }

    #[test]
    fn clean_run_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast_config(
            tmp.path(),
            "printf 'Loading\\nExiting batchmode successfully now!\\n' > '$LOG'; exit 0",
        );
        let mut report = RunReport::default();
        let outcome = run(&config, &mut report);
        assert_eq!(outcome.verdict, RunVerdict::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.resolution, Some(Resolution::UseExitCode));
    }

    #[test]
    fn failure_signature_beats_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast_config(
            tmp.path(),
            "printf 'Scripts have compiler errors.\\nCleanup mono\\n' > '$LOG'; exit 0",
        );
        let mut report = RunReport::default();
        let outcome = run(&config, &mut report);
        assert_eq!(outcome.verdict, RunVerdict::Failure);
        assert!(report.summary.has_errors());
    }

    #[test]
    fn exit_code_mismatch_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = fast_config(tmp.path(), "printf 'Cleanup mono\\n' > '$LOG'; exit 3");
        let mut report = RunReport::default();
        assert_eq!(run(&config, &mut report).verdict, RunVerdict::Failure);
        assert!(report.summary.render().contains("does not match expected exit code 0"));

        config.expected_exit_code = 3;
        let mut report = RunReport::default();
        assert_eq!(run(&config, &mut report).verdict, RunVerdict::Success);
    }

    #[test]
    fn instability_respawns_once_with_fresh_log() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("first-attempt-done");
        let script = format!(
            "if [ -f '{marker}' ]; then printf 'Cleanup mono\\n' >> '$LOG'; \
             else touch '{marker}'; printf 'Cannot connect to registry\\nCleanup mono\\n' >> '$LOG'; fi; exit 0",
            marker = marker.display()
        );
        let config = fast_config(tmp.path(), &script);
        let mut report = RunReport::default();
        let outcome = run(&config, &mut report);
        assert_eq!(outcome.verdict, RunVerdict::Success);
        assert_eq!(outcome.attempts, 2);

        // Appended, so a stale log would still contain the first attempt.
        let log = fs::read_to_string(&config.log_file).unwrap();
        assert_eq!(log, "Cleanup mono\n");
    }

    #[test]
    fn instability_without_budget_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = fast_config(
            tmp.path(),
            "printf 'connect ETIMEDOUT\\nCleanup mono\\n' > '$LOG'; exit 0",
        );
        config.retry_limit = 0;
        let mut report = RunReport::default();
        let outcome = run(&config, &mut report);
        assert_eq!(outcome.verdict, RunVerdict::Failure);
        assert_eq!(outcome.attempts, 1);
        assert!(report.summary.render().contains("Retry budget exhausted"));
    }

    #[test]
    fn thirty_five_warnings_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let script = "i=0; while [ $i -lt 35 ]; do \
             printf '##utp:{\"type\":\"LogEntry\",\"severity\":\"Warning\",\"message\":\"w%s\"}\\n' $i >> '$LOG'; \
             i=$((i+1)); done; printf 'Cleanup mono\\n' >> '$LOG'; exit 0";

        let mut config = fast_config(tmp.path(), script);
        let mut report = RunReport::default();
        let outcome = run(&config, &mut report);
        assert_eq!(outcome.verdict, RunVerdict::Success);
        assert!(report.summary.render().contains("30 of 35 printed, 5 withheld"));

        config.policies.treat_warnings_as_failures = true;
        let mut report = RunReport::default();
        assert_eq!(run(&config, &mut report).verdict, RunVerdict::Failure);
    }

    #[test]
    fn empty_log_with_clean_exit_is_a_crash() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fast_config(tmp.path(), ": > '$LOG'; exit 0");
        let mut report = RunReport::default();
        let outcome = run(&config, &mut report);
        assert_eq!(outcome.verdict, RunVerdict::Failure);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(report.summary.render().contains("without a recognised exit marker"));
    }

    #[test]
    fn hung_host_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = fast_config(tmp.path(), "printf 'Loading\\n' > '$LOG'; sleep 30");
        config.timeout = Some(Duration::from_millis(200));
        let mut report = RunReport::default();
        let outcome = run(&config, &mut report);
        assert_eq!(outcome.verdict, RunVerdict::TimedOut);
        assert!(outcome.elapsed < Duration::from_secs(20));
    }

    #[test]
    fn errors_can_be_excused_by_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = tmp.path().join("Game.exe");
        fs::write(&artifact, "binary").unwrap();

        let mut config = fast_config(
            tmp.path(),
            "printf '##utp:{\"type\":\"LogEntry\",\"severity\":\"Error\",\"message\":\"flaky\"}\\nCleanup mono\\n' > '$LOG'; exit 0",
        );
        let mut report = RunReport::default();
        assert_eq!(run(&config, &mut report).verdict, RunVerdict::Failure);

        config.expected_artifact = Some(artifact);
        config.policies.accept_errors_with_artifact = true;
        let mut report = RunReport::default();
        assert_eq!(run(&config, &mut report).verdict, RunVerdict::Success);
    }

    #[test]
    fn missing_program_fails_to_start_without_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = fast_config(tmp.path(), "exit 0");
        config.program = tmp.path().join("no-such-host");
        let mut report = RunReport::default();
        let outcome = run(&config, &mut report);
        assert_eq!(outcome.verdict, RunVerdict::FailedToStart);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.verdict.exit_code(), 2);
    }

    #[test]
    fn undeletable_log_fails_to_start() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = fast_config(tmp.path(), "exit 0");
        config.log_file = tmp.path().join("log-is-a-dir");
        fs::create_dir(&config.log_file).unwrap();
        let mut report = RunReport::default();
        assert_eq!(run(&config, &mut report).verdict, RunVerdict::FailedToStart);
    }

    #[test]
    fn delete_log_tolerates_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        delete_log(&tmp.path().join("absent.log"), 3, Duration::from_millis(1)).unwrap();

        let present = tmp.path().join("present.log");
        fs::write(&present, "old").unwrap();
        delete_log(&present, 3, Duration::from_millis(1)).unwrap();
        assert!(!present.exists());
    }

    #[test]
    fn verdict_exit_codes() {
        assert_eq!(RunVerdict::Success.exit_code(), 0);
        assert_eq!(RunVerdict::Failure.exit_code(), 1);
        assert_eq!(RunVerdict::TimedOut.exit_code(), 1);
        assert!(!RunVerdict::TimedOut.is_success());
    }
}
