// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod supervisor;
pub mod types;
pub mod watch;

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::{CliArgs, IdArgs, ManagerArgs, RunArgs};
use crate::config::{ConfigFile, ensure_has_slaves, load_and_validate, load_or_default};
use crate::engine::Manager;
use crate::exec::{INITIAL_STATE_ENV, SLAVE_INITIAL_STATE_ENV, SLAVE_RESULT_ENV};
use crate::supervisor::{ProcessRole, Respawn};
use crate::watch::{ProgramId, default_search_path};

/// High-level entry point used by `main.rs`.
///
/// Detects the process role once, loads the config and dispatches to the
/// subcommand. Returns the exit code for the process.
pub async fn run(args: CliArgs) -> Result<i32> {
    let role = ProcessRole::detect();
    debug!(?role, "detected process role");

    match args.command {
        cli::Command::Run(run_args) => {
            let cfg = load_or_default(&args.config)
                .with_context(|| format!("loading config from {:?}", args.config))?;
            tokio::task::spawn_blocking(move || cmd_run(run_args, &cfg, role))
                .await
                .context("run task panicked")?
        }
        cli::Command::Manager(manager_args) => {
            let cfg = load_and_validate(&args.config)
                .with_context(|| format!("loading config from {:?}", args.config))?;
            cmd_manager(manager_args, &cfg).await
        }
        cli::Command::Id(id_args) => {
            let cfg = load_or_default(&args.config)
                .with_context(|| format!("loading config from {:?}", args.config))?;
            cmd_id(id_args, &cfg)
        }
    }
}

fn search_path_or_default(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if dirs.is_empty() {
        return Ok(default_search_path());
    }
    dirs.iter()
        .map(|d| std::path::absolute(d).with_context(|| format!("resolving search path {d:?}")))
        .collect()
}

/// `respawn run`: supervise a command, re-executing on change.
fn cmd_run(args: RunArgs, cfg: &ConfigFile, role: ProcessRole) -> Result<i32> {
    let mut watch = cfg.watch.clone();
    if let Some(ms) = args.poll_interval_ms {
        watch.poll_interval_ms = ms;
    }
    if let Some(ms) = args.debounce_ms {
        watch.debounce_ms = ms;
    }

    let mut respawn = Respawn::new(role)
        .with_policy(watch.hash_policy())
        .with_search_path(search_path_or_default(&args.search_path)?)
        .with_watcher(watch.watcher())
        .track_exe(!args.no_track_exe);

    for path in &args.track {
        respawn.requires(|loader| loader.track(path).map(|_| ()));
    }
    respawn.at_respawn(|| info!("tracked files changed"));

    let command = args.command;
    let code = respawn.run(None, move |ctx| {
        let (program, rest) = command
            .split_first()
            .context("no command given")?;
        info!(command = ?command, "running command");
        let status = Command::new(program)
            .args(rest)
            .env_remove(INITIAL_STATE_ENV)
            .env_remove(SLAVE_INITIAL_STATE_ENV)
            .env_remove(SLAVE_RESULT_ENV)
            .status()
            .with_context(|| format!("spawning {program:?}"))?;
        ctx.set_exit_code(status.code().unwrap_or(1));
        Ok(())
    })?;
    Ok(code)
}

/// `respawn manager`: run the configured slaves until Ctrl-C.
async fn cmd_manager(args: ManagerArgs, cfg: &ConfigFile) -> Result<i32> {
    ensure_has_slaves(cfg)?;

    let mut manager = Manager::from_config(cfg)?;
    if let Some(level) = args.parallel_level {
        manager.set_parallel_level(level.max(1));
    }
    manager.on_slave_finished(|slave| {
        info!(
            slave = %slave,
            exit_code = ?slave.exit_code(),
            success = slave.success().unwrap_or(false),
            "slave done"
        );
    });

    manager.run().await?;
    Ok(0)
}

/// `respawn id`: print content ids and the aggregate id.
fn cmd_id(args: IdArgs, cfg: &ConfigFile) -> Result<i32> {
    let search_path = search_path_or_default(&args.search_path)?;
    let mut program_id = ProgramId::with_policy(cfg.watch.hash_policy());
    program_id.register_files(&args.files, &search_path, false)?;

    for record in program_id.records() {
        println!("{}  {}", record.content_id, record.path.display());
    }
    println!("{}  (aggregate)", program_id.id());
    Ok(0)
}
