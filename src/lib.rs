//! Supervised Unity editor and player runs.
//!
//! The host process is spawned by [`supervisor`], whose log file is tailed
//! and classified by [`crawler`] until a resolution is reached. [`launch`]
//! builds the host command lines and runs the post-run checks.

pub mod cleaned_log;
pub mod cli;
pub mod config;
pub mod crawler;
pub mod findings;
pub mod launch;
pub mod log;
pub mod results;
pub mod rules;
pub mod session;
pub mod settings;
pub mod shell_completion;
pub mod supervisor;
pub mod tail;
pub mod utp;
pub mod version;
