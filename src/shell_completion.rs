//! Completion scripts for the `unity-launcher` binary.

use std::io::{self, Write};

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::cli::{Cli, CompletionShell};

const BIN_NAME: &str = "unity-launcher";

fn shell_for(shell: CompletionShell) -> Shell {
    match shell {
        CompletionShell::Bash => Shell::Bash,
        CompletionShell::Zsh => Shell::Zsh,
        CompletionShell::Fish => Shell::Fish,
    }
}

pub fn write(shell: CompletionShell, out: &mut dyn Write) {
    let mut cmd = Cli::command();
    generate(shell_for(shell), &mut cmd, BIN_NAME, out);
}

pub fn print(shell: CompletionShell) -> Result<()> {
    write(shell, &mut io::stdout());
    Ok(())
}
