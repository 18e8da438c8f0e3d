use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use unity_launcher::cleaned_log;
use unity_launcher::cli::{Cli, Command, EditorArgs, PlayerArgs, RunArgs};
use unity_launcher::config::{ProjectConfig, render_config_human, render_config_json};
use unity_launcher::crawler::RunReport;
use unity_launcher::launch;
use unity_launcher::log::RunLog;
use unity_launcher::results;
use unity_launcher::settings::{self, SettingsOverrides};
use unity_launcher::shell_completion;
use unity_launcher::supervisor::{self, RunVerdict};

fn run_editor(args: &EditorArgs, config: &ProjectConfig) -> RunVerdict {
    let mut report = RunReport::new(config.report.display_limit);

    let overrides = SettingsOverrides {
        scripting_backend: args.scripting_backend,
        resolution_dialog: args.display_resolution_dialog,
        scene: args.scene.clone(),
    };
    let applied = match settings::apply(&args.project_path, &overrides) {
        Ok(applied) => applied,
        Err(e) => {
            report.summary.result_error(format!("{e:#}"));
            return finish(&args.run, RunVerdict::FailedToStart, &mut report.summary);
        }
    };

    let launch_config = launch::editor_launch(args, config);
    let outcome = supervisor::run(&launch_config, &mut report);

    if let Some(applied) = applied {
        if let Err(e) = applied.restore() {
            error!("{e:#}");
            report.summary.result_error(format!("{e:#}"));
        }
    }

    let mut verdict = outcome.verdict;
    if verdict != RunVerdict::FailedToStart {
        if args.runtests {
            let passed =
                launch::check_test_results(args.test_results.as_deref(), &mut report.summary);
            verdict = launch::demote(verdict, passed);
        }
        verdict = launch::demote(verdict, check_cleaned_log(&args.run, &mut report.summary));
        if verdict.is_success() {
            let present = launch::check_artifact(
                launch_config.expected_artifact.as_deref(),
                &mut report.summary,
            );
            verdict = launch::demote(verdict, present);
        }
    }

    finish(&args.run, verdict, &mut report.summary)
}

fn run_player(args: &PlayerArgs, config: &ProjectConfig) -> RunVerdict {
    let mut report = RunReport::new(config.report.display_limit);
    let launch_config = launch::player_launch(args, config);
    let outcome = supervisor::run(&launch_config, &mut report);

    let mut verdict = outcome.verdict;
    if verdict != RunVerdict::FailedToStart {
        verdict = launch::demote(verdict, check_cleaned_log(&args.run, &mut report.summary));
    }
    finish(&args.run, verdict, &mut report.summary)
}

fn check_cleaned_log(run: &RunArgs, summary: &mut RunLog) -> bool {
    let Some(path) = run.cleaned_log_file.as_deref() else {
        return true;
    };
    cleaned_log::check(path, summary).unwrap_or_else(|e| {
        summary.result_error(format!("{e:#}"));
        false
    })
}

fn finish(run: &RunArgs, verdict: RunVerdict, summary: &mut RunLog) -> RunVerdict {
    launch::conclude(verdict, summary);
    print!("{}", summary.render());
    if let Some(path) = &run.summary_json {
        if let Err(e) = summary.write_jsonl(path) {
            warn!("failed to write run summary: {e:#}");
        }
    }
    verdict
}

fn check_results(path: &Path) -> RunVerdict {
    let mut summary = RunLog::new();
    let verdict = match results::parse_file(path) {
        Ok(results) => {
            results.report(&mut summary);
            if results.passed() {
                RunVerdict::Success
            } else {
                RunVerdict::Failure
            }
        }
        Err(e) => {
            summary.result_error(format!("{e}"));
            RunVerdict::Failure
        }
    };
    launch::conclude(verdict, &mut summary);
    print!("{}", summary.render());
    verdict
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "unity_launcher=warn",
        0 => "unity_launcher=info",
        1 => "unity_launcher=debug",
        _ => "unity_launcher=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .unity-launcher/config.toml found, using defaults"),
        }
    }

    let verdict = match cli.command {
        Command::Editor(args) => run_editor(&args, &config),
        Command::Player(args) => run_player(&args, &config),
        Command::CheckResults { path } => check_results(&path),
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
            return Ok(());
        }
        Command::Completions { shell } => {
            shell_completion::print(shell)?;
            return Ok(());
        }
    };

    std::process::exit(verdict.exit_code());
}
