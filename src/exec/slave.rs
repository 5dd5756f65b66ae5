// src/exec/slave.rs

//! One supervised child process plus its dependency-tracking state.

use std::fmt;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::errors::{RespawnError, Result};
use crate::exec::channel::{
    self, ResultChannel, SLAVE_INITIAL_STATE_ENV, SLAVE_RESULT_ENV, clear_cloexec,
};
use crate::exec::need::{NeedState, resolve_needed};
use crate::types::{InitialState, SpawnOptions, Subcommand};
use crate::watch::{ProgramId, default_search_path};

static NEXT_SLAVE_ID: AtomicUsize = AtomicUsize::new(1);

/// Process-unique handle for a [`Slave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlaveId(usize);

impl SlaveId {
    fn next() -> Self {
        SlaveId(NEXT_SLAVE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a slave process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    /// Constructed, never spawned.
    Idle,
    /// Spawned, not reaped yet.
    Running,
    /// Reaped; exit status available.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlaveKind {
    /// A real child process.
    Child,
    /// The manager's own process. Always running, never needed.
    Supervisor,
}

/// A supervised subprocess job.
#[derive(Debug)]
pub struct Slave {
    id: SlaveId,
    kind: SlaveKind,
    name: Option<String>,
    cmdline: Vec<String>,
    options: SpawnOptions,
    search_path: Vec<PathBuf>,
    program_id: ProgramId,
    need: NeedState,
    pid: Option<Pid>,
    status: Option<WaitStatus>,
    success: bool,
    subcommands: Vec<Subcommand>,
    result: Option<ResultChannel>,
}

impl fmt::Display for Slave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SlaveKind::Supervisor => write!(f, "slave {} (manager)", self.id),
            SlaveKind::Child => match &self.name {
                Some(name) => write!(f, "slave {} {}", self.id, name),
                None => write!(f, "slave {} `{}`", self.id, self.cmdline.join(" ")),
            },
        }
    }
}

impl Slave {
    pub fn new<I, S>(cmdline: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: SlaveId::next(),
            kind: SlaveKind::Child,
            name: None,
            cmdline: cmdline.into_iter().map(Into::into).collect(),
            options: SpawnOptions::default(),
            search_path: default_search_path(),
            program_id: ProgramId::new(),
            need: NeedState::ForcedNeeded,
            pid: None,
            status: None,
            success: false,
            subcommands: Vec::new(),
            result: None,
        }
    }

    /// Pseudo-slave standing for the current (manager) process.
    pub fn for_self(seed: &ProgramId) -> Self {
        let mut slave = Self::new(std::env::args());
        slave.kind = SlaveKind::Supervisor;
        slave.program_id = seed.clone();
        slave.need = NeedState::ForcedNotNeeded;
        slave.pid = Some(Pid::this());
        slave
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Start from a copy of `seed`, so already-known files are not
    /// rediscovered and rehashed.
    pub fn with_seed(mut self, seed: &ProgramId) -> Self {
        self.program_id = seed.clone();
        self
    }

    pub fn with_options(mut self, options: SpawnOptions) -> Self {
        if let Some(dir) = &options.current_dir {
            if let Ok(dir) = std::path::absolute(dir) {
                self.search_path.insert(0, dir);
            }
        }
        self.options = options;
        self
    }

    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn id(&self) -> SlaveId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn cmdline(&self) -> &[String] {
        &self.cmdline
    }

    pub fn options(&self) -> &SpawnOptions {
        &self.options
    }

    pub fn program_id(&self) -> &ProgramId {
        &self.program_id
    }

    pub fn program_id_mut(&mut self) -> &mut ProgramId {
        &mut self.program_id
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    pub fn is_self(&self) -> bool {
        self.kind == SlaveKind::Supervisor
    }

    /// PID of the current process, or of the last one once finished.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Wait status of the last run; `None` while running or never run.
    pub fn status(&self) -> Option<WaitStatus> {
        self.status
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            Some(WaitStatus::Exited(_, code)) => Some(code),
            _ => None,
        }
    }

    pub fn subcommands(&self) -> &[Subcommand] {
        &self.subcommands
    }

    pub fn need_state(&self) -> NeedState {
        self.need
    }

    pub fn state(&self) -> SlaveState {
        if self.is_running() {
            SlaveState::Running
        } else if self.is_finished() {
            SlaveState::Finished
        } else {
            SlaveState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        match self.kind {
            SlaveKind::Supervisor => true,
            SlaveKind::Child => self.pid.is_some() && self.status.is_none(),
        }
    }

    pub fn is_finished(&self) -> bool {
        match self.kind {
            SlaveKind::Supervisor => false,
            SlaveKind::Child => self.pid.is_some() && self.status.is_some(),
        }
    }

    /// Register files on this slave's program id.
    pub fn register_files<I, P>(&mut self, files: I, ignore_not_found: bool) -> Result<Vec<PathBuf>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.program_id
            .register_files(files, &self.search_path, ignore_not_found)
    }

    /// Whether the next scheduling pass should (re)start this slave.
    pub fn needed(&self) -> bool {
        if self.is_self() || self.is_running() {
            return false;
        }
        resolve_needed(self.need, &self.program_id)
    }

    pub fn mark_needed(&mut self) {
        if !self.is_self() {
            self.need = NeedState::ForcedNeeded;
        }
    }

    pub fn mark_not_needed(&mut self) {
        self.need = NeedState::ForcedNotNeeded;
    }

    /// Go back to deciding from the tracked files.
    pub fn needed_auto(&mut self) {
        if !self.is_self() {
            self.need = NeedState::Auto;
        }
    }

    /// Whether the last run produced a well-formed report.
    ///
    /// This is independent of the exit code; see [`Slave::status`].
    pub fn success(&self) -> Result<bool> {
        if self.status.is_none() {
            let what = if self.pid.is_some() { "running" } else { "never started" };
            return Err(RespawnError::NotFinished(format!("{self} ({what})")));
        }
        Ok(self.success)
    }

    /// Launch the process and hand it its initial state.
    pub fn spawn(&mut self) -> Result<Pid> {
        if self.is_self() {
            return Ok(Pid::this());
        }
        if self.is_running() {
            return Err(RespawnError::AlreadyRunning(self.to_string()));
        }
        let (program, args) = self
            .cmdline
            .split_first()
            .ok_or_else(|| RespawnError::ConfigError(format!("{self} has an empty command line")))?;

        self.program_id.refresh();
        let initial = channel::snapshot_file(&InitialState {
            name: self.name.clone(),
            program_id: self.program_id.clone(),
        })?;
        let (result_r, result_w) = channel::pipe()?;
        let result = ResultChannel::new(result_r)?;

        let child_initial = initial.as_raw_fd();
        let child_result = result_w.as_raw_fd();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.options.env)
            .env(SLAVE_INITIAL_STATE_ENV, child_initial.to_string())
            .env(SLAVE_RESULT_ENV, child_result.to_string());
        if let Some(dir) = &self.options.current_dir {
            cmd.current_dir(dir);
        }
        if self.options.process_group {
            cmd.process_group(0);
        }
        // SAFETY: the hook only calls fcntl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                clear_cloexec(child_initial)?;
                clear_cloexec(child_result)
            });
        }

        let child = cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        drop(initial);
        drop(result_w);

        self.need = NeedState::Auto;
        self.pid = Some(pid);
        self.status = None;
        self.success = false;
        self.subcommands.clear();
        self.result = Some(result);

        info!(
            slave = %self,
            pid = pid.as_raw(),
            files = self.program_id.len(),
            "spawned slave"
        );
        Ok(pid)
    }

    /// Pull whatever the child already wrote, so a large report cannot fill
    /// the pipe and stall it.
    pub fn poll_result(&mut self) {
        if let Some(result) = self.result.as_mut() {
            if let Err(e) = result.drain() {
                warn!(slave = %self.id, error = %e, "failed to read result channel");
            }
        }
    }

    /// Non-blocking check for process exit. Does not call
    /// [`Slave::finished`].
    pub fn try_wait(&self) -> Result<Option<WaitStatus>> {
        let pid = match self.pid {
            Some(pid) if self.is_running() && !self.is_self() => pid,
            _ => return Ok(None),
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(status)),
            Err(Errno::EINTR) => Ok(None),
            Err(Errno::ECHILD) => {
                warn!(slave = %self, pid = pid.as_raw(), "child was reaped elsewhere");
                Ok(Some(WaitStatus::Exited(pid, -1)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record the process exit and read its report.
    ///
    /// Returns the files that are new or whose content changed compared to
    /// this slave's program id. If there are any, the slave marks itself as
    /// needed: the set of things it depends on just grew.
    ///
    /// A missing or truncated report is not an error: the run is recorded
    /// as unsuccessful with no subcommands and no files.
    pub fn finished(&mut self, status: WaitStatus) -> Vec<PathBuf> {
        self.status = Some(status);

        let buffer = match self.result.take() {
            Some(mut result) => {
                if let Err(e) = result.drain() {
                    warn!(slave = %self, error = %e, "failed to read result channel");
                }
                result.into_buffer()
            }
            None => Vec::new(),
        };

        let files = match channel::decode_report(&buffer) {
            Ok(report) => {
                self.success = true;
                self.subcommands = report.subcommands;
                report.files
            }
            Err(e) => {
                debug!(slave = %self, bytes = buffer.len(), error = %e, "no usable report from slave");
                self.success = false;
                self.subcommands = Vec::new();
                Vec::new()
            }
        };

        let modified = if self.success {
            match self.program_id.slice(&files, &self.search_path, true) {
                Ok(sliced) => self.program_id = sliced,
                Err(e) => warn!(slave = %self, error = %e, "failed to slice program id"),
            }
            self.program_id
                .register_files(&files, &self.search_path, true)
                .unwrap_or_else(|e| {
                    warn!(slave = %self, error = %e, "failed to register reported files");
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        if !modified.is_empty() {
            self.mark_needed();
        }

        info!(
            slave = %self,
            status = ?status,
            success = self.success,
            subcommands = self.subcommands.len(),
            modified = modified.len(),
            "slave finished"
        );
        modified
    }

    /// Send `signal` to the process; with `join`, wait for it and record
    /// the exit.
    pub fn kill(&mut self, signal: Signal, join: bool) -> Result<()> {
        if self.is_self() || !self.is_running() {
            return Ok(());
        }
        if let Some(pid) = self.pid {
            match signal::kill(pid, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if join {
            self.join()?;
        }
        Ok(())
    }

    /// Block until the process exits, then call [`Slave::finished`].
    pub fn join(&mut self) -> Result<Vec<PathBuf>> {
        let pid = match self.pid {
            Some(pid) if self.is_running() && !self.is_self() => pid,
            _ => return Ok(Vec::new()),
        };
        let status = loop {
            match waitpid(pid, None) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!(slave = %self, pid = pid.as_raw(), "child was reaped elsewhere");
                    break WaitStatus::Exited(pid, -1);
                }
                Err(e) => return Err(e.into()),
            }
        };
        Ok(self.finished(status))
    }
}
