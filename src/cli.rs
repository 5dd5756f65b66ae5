// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `respawn`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "respawn",
    version,
    about = "Re-run commands and worker pools when the files they depend on change.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Respawn.toml` in the current working directory. Optional
    /// for `run` and `id`.
    #[arg(long, global = true, value_name = "PATH", default_value = "Respawn.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `RESPAWN_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a command, then re-exec when a tracked file changes.
    ///
    /// When spawned by `respawn manager`, runs the command once and reports
    /// the tracked files back instead.
    Run(RunArgs),

    /// Run the slaves declared in the config until Ctrl-C.
    Manager(ManagerArgs),

    /// Print content ids and the aggregate id of a set of files.
    Id(IdArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    /// File the command depends on. Repeatable.
    #[arg(long = "track", value_name = "PATH")]
    pub track: Vec<PathBuf>,

    /// Directory to resolve relative `--track` paths against. Repeatable;
    /// defaults to the current directory.
    #[arg(long = "search-path", value_name = "DIR")]
    pub search_path: Vec<PathBuf>,

    /// Overrides `[watch].poll_interval_ms`.
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Overrides `[watch].debounce_ms`.
    #[arg(long, value_name = "MS")]
    pub debounce_ms: Option<u64>,

    /// Do not track the `respawn` executable itself.
    #[arg(long)]
    pub no_track_exe: bool,

    /// Command and arguments.
    #[arg(last = true, required = true, value_name = "CMD")]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ManagerArgs {
    /// Overrides `[manager].parallel_level`.
    #[arg(short = 'j', long = "parallel-level", value_name = "N")]
    pub parallel_level: Option<usize>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct IdArgs {
    #[arg(long = "search-path", value_name = "DIR")]
    pub search_path: Vec<PathBuf>,

    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<PathBuf>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
