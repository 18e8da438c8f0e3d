use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::settings::{ResolutionDialog, ScriptingBackend};

#[derive(Parser, Debug)]
#[command(
    name = "unity-launcher",
    about = "Run Unity editors and players in CI and judge the result from their logs",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the editor on a project
    Editor(EditorArgs),

    /// Run a built player
    Player(PlayerArgs),

    /// Check an XML test results file
    CheckResults {
        /// Path to the results file
        path: PathBuf,
    },

    /// Show the effective configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print shell completion script
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

/// Options shared by editor and player runs.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Where the host writes its log
    #[arg(long)]
    pub log_file: PathBuf,

    /// Log that only receives warnings, errors and assertions
    #[arg(long)]
    pub cleaned_log_file: Option<PathBuf>,

    /// Kill the run after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Do not fail the run when it times out
    #[arg(long, default_value_t = false)]
    pub timeout_ignore: bool,

    /// Exit code a successful run ends with
    #[arg(long)]
    pub expected_exit_code: Option<i32>,

    /// Also write the run summary as JSON lines
    #[arg(long)]
    pub summary_json: Option<PathBuf>,

    /// Run in batch mode
    #[arg(long, default_value_t = false)]
    pub batchmode: bool,

    /// Do not initialise the graphics device
    #[arg(long, default_value_t = false)]
    pub nographics: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EditorArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Editor executable
    #[arg(long)]
    pub unity_executable: PathBuf,

    /// Project to open
    #[arg(long)]
    pub project_path: PathBuf,

    /// Where the test results XML is written
    #[arg(long)]
    pub test_results: Option<PathBuf>,

    /// Execute the project's tests
    #[arg(long, default_value_t = false)]
    pub runtests: bool,

    /// Quit after other commands finish (ignored with --runtests)
    #[arg(long, default_value_t = false)]
    pub quit: bool,

    /// Do not show a crash dialog
    #[arg(long, default_value_t = false)]
    pub silent_crashes: bool,

    /// Extra test progress logging
    #[arg(long, default_value_t = false)]
    pub automated: bool,

    /// Fail the run on any warning
    #[arg(long, default_value_t = false)]
    pub warnings_as_errors: bool,

    /// Also report errors logged inside tests that pass
    #[arg(long, default_value_t = false)]
    pub escalate_in_test_errors: bool,

    /// Ignore logged errors when the expected build artifact exists
    #[arg(long, default_value_t = false)]
    pub accept_errors_with_artifact: bool,

    /// Rule set used to read the log
    #[arg(long, value_enum, default_value_t = RulesArg::Auto)]
    pub rules: RulesArg,

    /// Re-spawns allowed after infrastructure instability
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Override the standalone scripting backend for this run
    #[arg(long, value_enum)]
    pub scripting_backend: Option<ScriptingBackend>,

    /// Override the resolution dialog setting for this run
    #[arg(long, value_enum)]
    pub display_resolution_dialog: Option<ResolutionDialog>,

    /// Build only this scene (path relative to the project)
    #[arg(long)]
    pub scene: Option<String>,

    /// Build a Windows 64-bit player at this path
    #[arg(long)]
    pub build_windows64_player: Option<String>,

    /// Build a Linux universal player at this path
    #[arg(long)]
    pub build_linux_universal_player: Option<String>,

    /// Build a macOS universal player at this path
    #[arg(long)]
    pub build_osx_universal_player: Option<String>,

    /// Arguments passed to the editor unchanged
    #[arg(last = true)]
    pub extra: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct PlayerArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Player executable
    #[arg(long)]
    pub executable: PathBuf,

    /// Window height
    #[arg(long)]
    pub screen_height: Option<u32>,

    /// Window width
    #[arg(long)]
    pub screen_width: Option<u32>,

    /// Name of the quality level
    #[arg(long)]
    pub screen_quality: Option<String>,

    /// Arguments passed to the player unchanged
    #[arg(last = true)]
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RulesArg {
    Auto,
    Modern,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
