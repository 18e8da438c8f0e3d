//! Argument builders and post-run checks for the editor and player commands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::cli::{EditorArgs, PlayerArgs, RulesArg, RunArgs};
use crate::config::ProjectConfig;
use crate::crawler::{Policies, RuleSelection};
use crate::log::RunLog;
use crate::results;
use crate::rules::RuleSet;
use crate::supervisor::{LaunchConfig, RunVerdict};

/// Command line for an editor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorCommand {
    pub args: Vec<String>,
    /// Player build output the run is expected to produce.
    pub expected_artifact: Option<PathBuf>,
}

fn absolute(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

pub fn editor_command(editor: &EditorArgs) -> EditorCommand {
    let run = &editor.run;
    let mut args = vec![
        "-logFile".to_string(),
        absolute(&run.log_file),
        "-projectPath".to_string(),
        absolute(&editor.project_path),
    ];
    if let Some(cleaned) = &run.cleaned_log_file {
        args.push("-cleanedLogFile".to_string());
        args.push(absolute(cleaned));
    }
    args.extend(editor.extra.iter().cloned());

    if run.batchmode {
        info!("Batchmode is set");
        args.push("-batchmode".to_string());
    }
    if run.nographics {
        info!("Nographics is set");
        args.push("-nographics".to_string());
    }
    if editor.silent_crashes {
        info!("silent crashes is set");
        args.push("-silent-crashes".to_string());
    }
    if editor.automated {
        info!("automated is set");
        args.push("-automated".to_string());
    }
    if editor.runtests {
        info!("runtests is set");
        args.push("-runTests".to_string());
        match &editor.test_results {
            Some(results) => {
                args.push("-testResults".to_string());
                args.push(absolute(results));
            }
            None => warn!(
                "runtests is set without test results; the results cannot be checked as part of the report"
            ),
        }
    }
    if editor.quit {
        if editor.runtests {
            warn!("quit and runtests cannot be set at once. Ignoring quit");
        } else {
            args.push("-quit".to_string());
        }
    }

    let mut expected_artifact = None;
    let builds = [
        ("-buildWindows64Player", &editor.build_windows64_player),
        ("-buildLinuxUniversalPlayer", &editor.build_linux_universal_player),
        ("-buildOSXUniversalPlayer", &editor.build_osx_universal_player),
    ];
    for (flag, target) in builds {
        if let Some(target) = target {
            info!("{} is set", flag.trim_start_matches('-'));
            args.push(flag.to_string());
            args.push(target.clone());
            expected_artifact = Some(editor.project_path.join(target));
        }
    }

    EditorCommand {
        args,
        expected_artifact,
    }
}

pub fn player_command(player: &PlayerArgs) -> Vec<String> {
    let run = &player.run;
    let mut args = vec!["-logFile".to_string(), absolute(&run.log_file)];
    if let Some(cleaned) = &run.cleaned_log_file {
        args.push("-cleanedLogFile".to_string());
        args.push(absolute(cleaned));
    }
    if run.batchmode {
        info!("Batchmode is set");
        args.push("-batchmode".to_string());
    }
    if run.nographics {
        info!("Nographics is set");
        args.push("-nographics".to_string());
    }
    if let Some(height) = player.screen_height {
        args.push("-screen-height".to_string());
        args.push(height.to_string());
    }
    if let Some(width) = player.screen_width {
        args.push("-screen-width".to_string());
        args.push(width.to_string());
    }
    if let Some(quality) = &player.screen_quality {
        args.push("-screen-quality".to_string());
        args.push(quality.clone());
    }
    args.extend(player.extra.iter().cloned());
    args
}

/// Build the supervisor configuration: file defaults first, then CLI flags.
pub fn launch_config(
    program: &Path,
    args: Vec<String>,
    run: &RunArgs,
    config: &ProjectConfig,
) -> LaunchConfig {
    let mut launch = LaunchConfig::new(program, args, &run.log_file);
    launch.expected_exit_code = run
        .expected_exit_code
        .unwrap_or(config.defaults.expected_exit_code);
    launch.timeout = run
        .timeout
        .or(config.defaults.timeout_secs)
        .map(Duration::from_secs);
    launch.retry_limit = config.defaults.retry_limit;
    launch.retry_backoff = Duration::from_secs(config.defaults.retry_backoff_secs);
    launch.delete_attempts = config.cleanup.delete_attempts;
    launch.delete_backoff = Duration::from_millis(config.cleanup.delete_backoff_millis);
    launch.crawler = config.crawler.settings();
    launch.policies = config.policy.policies();
    if run.timeout_ignore {
        info!("timeout ignore is set");
        launch.policies.timeout_is_not_fatal = true;
    }
    launch
}

pub fn editor_launch(editor: &EditorArgs, config: &ProjectConfig) -> LaunchConfig {
    let command = editor_command(editor);
    let mut launch = launch_config(
        &editor.unity_executable,
        command.args,
        &editor.run,
        config,
    );
    launch.expected_artifact = command.expected_artifact;
    launch.rules = match editor.rules {
        RulesArg::Auto => RuleSelection::Auto,
        RulesArg::Modern => RuleSelection::Fixed(RuleSet::modern()),
        RulesArg::Legacy => RuleSelection::Fixed(RuleSet::legacy()),
    };
    if let Some(limit) = editor.retry_limit {
        launch.retry_limit = limit;
    }
    if editor.warnings_as_errors {
        info!("warnings as errors is set");
    }
    let policies: &mut Policies = &mut launch.policies;
    policies.treat_warnings_as_failures |= editor.warnings_as_errors;
    policies.escalate_in_test_errors |= editor.escalate_in_test_errors;
    policies.accept_errors_with_artifact |= editor.accept_errors_with_artifact;
    launch
}

/// Players are never re-spawned.
pub fn player_launch(player: &PlayerArgs, config: &ProjectConfig) -> LaunchConfig {
    let mut launch = launch_config(
        &player.executable,
        player_command(player),
        &player.run,
        config,
    );
    launch.rules = RuleSelection::Fixed(RuleSet::player(launch.expected_exit_code));
    launch.retry_limit = 0;
    launch
}

/// Check the XML test results of a `-runTests` run.
pub fn check_test_results(path: Option<&Path>, summary: &mut RunLog) -> bool {
    let Some(path) = path else {
        summary.result_error("Tests were run but no test results file was given");
        return false;
    };
    if !path.exists() {
        summary.result_error(format!("Could not find {}", path.display()));
        return false;
    }

    info!("Parsing {}", path.display());
    match results::parse_file(path) {
        Ok(results) => {
            results.report(summary);
            results.passed()
        }
        Err(e) => {
            summary.result_error(format!("{}: {e}", path.display()));
            false
        }
    }
}

/// Check that the expected build output exists, as a file or a directory.
pub fn check_artifact(artifact: Option<&Path>, summary: &mut RunLog) -> bool {
    match artifact {
        Some(path) if !path.exists() => {
            summary.result_error(format!(
                "Expected to find {} after the execution but it is missing. Check the log for what could have gone wrong",
                path.display()
            ));
            false
        }
        _ => true,
    }
}

/// Fold a failed post-run check into the engine's verdict.
pub fn demote(verdict: RunVerdict, check_passed: bool) -> RunVerdict {
    if check_passed || verdict != RunVerdict::Success {
        verdict
    } else {
        RunVerdict::Failure
    }
}

/// Append the closing line to the summary.
pub fn conclude(verdict: RunVerdict, summary: &mut RunLog) {
    if verdict.is_success() {
        summary.result_info("Everything looks good. Run has passed");
    } else {
        summary.result_error("Run has failed");
    }
}
