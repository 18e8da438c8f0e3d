use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crawler::{CrawlerSettings, Policies};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".unity-launcher";

#[derive(Debug, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub expected_exit_code: i32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_retry_limit() -> u32 {
    50
}

fn default_retry_backoff_secs() -> u64 {
    30
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            expected_exit_code: 0,
            timeout_secs: None,
            retry_limit: default_retry_limit(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_active_poll_millis")]
    pub active_poll_millis: u64,
    #[serde(default = "default_missing_poll_millis")]
    pub missing_poll_millis: u64,
    #[serde(default = "default_death_ticks")]
    pub death_ticks: u32,
    #[serde(default = "default_death_tick_millis")]
    pub death_tick_millis: u64,
    #[serde(default = "default_recent_lines")]
    pub recent_lines: usize,
    #[serde(default = "default_version_scan_lines")]
    pub version_scan_lines: usize,
    #[serde(default = "default_timings_log")]
    pub timings_log: bool,
}

fn default_active_poll_millis() -> u64 {
    10
}

fn default_missing_poll_millis() -> u64 {
    1000
}

fn default_death_ticks() -> u32 {
    10
}

fn default_death_tick_millis() -> u64 {
    1000
}

fn default_recent_lines() -> usize {
    crate::rules::DEFAULT_RECENT_LINES
}

fn default_version_scan_lines() -> usize {
    crate::version::DEFAULT_SCAN_LINES
}

fn default_timings_log() -> bool {
    true
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            active_poll_millis: default_active_poll_millis(),
            missing_poll_millis: default_missing_poll_millis(),
            death_ticks: default_death_ticks(),
            death_tick_millis: default_death_tick_millis(),
            recent_lines: default_recent_lines(),
            version_scan_lines: default_version_scan_lines(),
            timings_log: default_timings_log(),
        }
    }
}

impl CrawlerConfig {
    pub fn settings(&self) -> CrawlerSettings {
        CrawlerSettings {
            active_poll: Duration::from_millis(self.active_poll_millis),
            missing_poll: Duration::from_millis(self.missing_poll_millis),
            death_ticks: self.death_ticks,
            death_tick: Duration::from_millis(self.death_tick_millis),
            recent_lines: self.recent_lines,
            version_scan_lines: self.version_scan_lines,
            timings_log: self.timings_log,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_delete_attempts")]
    pub delete_attempts: u32,
    #[serde(default = "default_delete_backoff_millis")]
    pub delete_backoff_millis: u64,
}

fn default_delete_attempts() -> u32 {
    50
}

fn default_delete_backoff_millis() -> u64 {
    10_000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_attempts: default_delete_attempts(),
            delete_backoff_millis: default_delete_backoff_millis(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_display_limit")]
    pub display_limit: usize,
}

fn default_display_limit() -> usize {
    crate::findings::DEFAULT_DISPLAY_LIMIT
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            display_limit: default_display_limit(),
        }
    }
}

/// Verdict policies. All off by default.
#[derive(Debug, Deserialize, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub treat_warnings_as_failures: bool,
    #[serde(default)]
    pub timeout_is_not_fatal: bool,
    #[serde(default)]
    pub escalate_in_test_errors: bool,
    #[serde(default)]
    pub accept_errors_with_artifact: bool,
}

impl PolicyConfig {
    pub fn policies(&self) -> Policies {
        Policies {
            treat_warnings_as_failures: self.treat_warnings_as_failures,
            timeout_is_not_fatal: self.timeout_is_not_fatal,
            escalate_in_test_errors: self.escalate_in_test_errors,
            accept_errors_with_artifact: self.accept_errors_with_artifact,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.unity-launcher/config.toml` file and
    /// load it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

pub fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| format!("(defaults, no {CONFIG_DIR}/{CONFIG_FILENAME} found)"))
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Defaults\n");
    push_kv(&mut output, "expected_exit_code", config.defaults.expected_exit_code);
    push_kv(
        &mut output,
        "timeout",
        config
            .defaults
            .timeout_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "(none)".to_string()),
    );
    push_kv(&mut output, "retry_limit", config.defaults.retry_limit);
    push_kv(
        &mut output,
        "retry_backoff",
        format!("{}s", config.defaults.retry_backoff_secs),
    );
    output.push('\n');

    output.push_str("Crawler\n");
    push_kv(
        &mut output,
        "active_poll",
        format!("{}ms", config.crawler.active_poll_millis),
    );
    push_kv(
        &mut output,
        "missing_poll",
        format!("{}ms", config.crawler.missing_poll_millis),
    );
    push_kv(&mut output, "death_ticks", config.crawler.death_ticks);
    push_kv(
        &mut output,
        "death_tick",
        format!("{}ms", config.crawler.death_tick_millis),
    );
    push_kv(&mut output, "recent_lines", config.crawler.recent_lines);
    push_kv(&mut output, "version_scan_lines", config.crawler.version_scan_lines);
    push_kv(&mut output, "timings_log", config.crawler.timings_log);
    output.push('\n');

    output.push_str("Cleanup\n");
    push_kv(&mut output, "delete_attempts", config.cleanup.delete_attempts);
    push_kv(
        &mut output,
        "delete_backoff",
        format!("{}ms", config.cleanup.delete_backoff_millis),
    );
    output.push('\n');

    output.push_str("Report\n");
    push_kv(&mut output, "display_limit", config.report.display_limit);
    output.push('\n');

    output.push_str("Policy\n");
    push_kv(
        &mut output,
        "warnings_as_failures",
        config.policy.treat_warnings_as_failures,
    );
    push_kv(&mut output, "timeout_not_fatal", config.policy.timeout_is_not_fatal);
    push_kv(
        &mut output,
        "escalate_in_test",
        config.policy.escalate_in_test_errors,
    );
    push_kv(
        &mut output,
        "accept_with_artifact",
        config.policy.accept_errors_with_artifact,
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "defaults": {
            "expected_exit_code": config.defaults.expected_exit_code,
            "timeout_secs": config.defaults.timeout_secs,
            "retry_limit": config.defaults.retry_limit,
            "retry_backoff_secs": config.defaults.retry_backoff_secs
        },
        "crawler": {
            "active_poll_millis": config.crawler.active_poll_millis,
            "missing_poll_millis": config.crawler.missing_poll_millis,
            "death_ticks": config.crawler.death_ticks,
            "death_tick_millis": config.crawler.death_tick_millis,
            "recent_lines": config.crawler.recent_lines,
            "version_scan_lines": config.crawler.version_scan_lines,
            "timings_log": config.crawler.timings_log
        },
        "cleanup": {
            "delete_attempts": config.cleanup.delete_attempts,
            "delete_backoff_millis": config.cleanup.delete_backoff_millis
        },
        "report": {
            "display_limit": config.report.display_limit
        },
        "policy": {
            "treat_warnings_as_failures": config.policy.treat_warnings_as_failures,
            "timeout_is_not_fatal": config.policy.timeout_is_not_fatal,
            "escalate_in_test_errors": config.policy.escalate_in_test_errors,
            "accept_errors_with_artifact": config.policy.accept_errors_with_artifact
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
