// src/supervisor/respawn.rs

//! Run a unit of work, wait for its files to change, re-exec.
//!
//! [`Respawn`] drives the standalone cycle:
//!
//! 1. load the snapshot handed over by the previous incarnation (if any),
//! 2. if every file the program depends on is in the snapshot and none of
//!    them changed, run the work and block until one of them changes,
//! 3. dump a fresh snapshot into an inherited descriptor and `exec` the
//!    program again.
//!
//! A process that finds untracked files skips straight to step 3, so the
//! work only ever runs in a process whose dependencies are all tracked.
//!
//! Spawned by a manager, the same driver runs the work exactly once and
//! reports the files to the manager instead.

use std::collections::BTreeSet;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, info, warn};

use crate::errors::{RespawnError, Result};
use crate::exec::INITIAL_STATE_ENV;
use crate::exec::channel::{clear_cloexec, snapshot_file};
use crate::supervisor::role::{ProcessRole, adopt_fd};
use crate::supervisor::session::SlaveSession;
use crate::types::Subcommand;
use crate::watch::{
    ChangeWatcher, HashPolicy, ProgramId, default_search_path, resolve_file_path,
};

/// Records the files a piece of loading code depends on.
///
/// Handed to the closure given to [`Respawn::requires`].
#[derive(Debug)]
pub struct Loader<'a> {
    search_path: &'a [PathBuf],
    loaded: Vec<PathBuf>,
    failed: Vec<PathBuf>,
}

impl Loader<'_> {
    /// Declare a dependency on `path`.
    ///
    /// A path that cannot be resolved is remembered as an error path, so
    /// its appearance later triggers a respawn.
    pub fn track(&mut self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        match resolve_file_path(path, self.search_path) {
            Ok(resolved) => {
                self.loaded.push(resolved.clone());
                Ok(resolved)
            }
            Err(e) => {
                self.failed.push(self.expected_location(path));
                Err(e)
            }
        }
    }

    /// Track `path` and read it.
    pub fn read_to_string(&mut self, path: impl AsRef<Path>) -> Result<String> {
        let resolved = self.track(path)?;
        match std::fs::read_to_string(&resolved) {
            Ok(s) => Ok(s),
            Err(e) => {
                self.failed.push(resolved);
                Err(e.into())
            }
        }
    }

    fn expected_location(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.search_path.first() {
            Some(dir) => dir.join(path),
            None => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
        }
    }
}

/// What a unit of work can hand back to [`Respawn::run`].
#[derive(Debug, Default)]
pub struct WorkContext {
    exit_code: i32,
    subcommands: Vec<Subcommand>,
    tracked: Vec<PathBuf>,
}

impl WorkContext {
    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = code;
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Ask the manager to run another slave. Ignored outside slave role.
    pub fn add_subcommand(&mut self, subcommand: Subcommand) {
        self.subcommands.push(subcommand);
    }

    /// Declare a dependency discovered while working.
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.tracked.push(path.into());
    }
}

type RespawnHandler = Box<dyn FnMut()>;

/// Self re-executing driver. See the module docs.
pub struct Respawn {
    role: ProcessRole,
    program_id: ProgramId,
    policy: HashPolicy,
    search_path: Vec<PathBuf>,
    watcher: ChangeWatcher,
    track_exe: bool,
    respawn_handlers: Vec<RespawnHandler>,
    errors: Vec<RespawnError>,
    required_paths: BTreeSet<PathBuf>,
    error_paths: BTreeSet<PathBuf>,
}

impl std::fmt::Debug for Respawn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Respawn")
            .field("role", &self.role)
            .field("program_id", &self.program_id.id())
            .field("required_paths", &self.required_paths)
            .field("error_paths", &self.error_paths)
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl Respawn {
    pub fn new(role: ProcessRole) -> Self {
        Self {
            role,
            program_id: ProgramId::new(),
            policy: HashPolicy::default(),
            search_path: default_search_path(),
            watcher: ChangeWatcher::default(),
            track_exe: true,
            respawn_handlers: Vec::new(),
            errors: Vec::new(),
            required_paths: BTreeSet::new(),
            error_paths: BTreeSet::new(),
        }
    }

    pub fn with_policy(mut self, policy: HashPolicy) -> Self {
        self.program_id = ProgramId::with_policy(policy.clone());
        self.policy = policy;
        self
    }

    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn with_watcher(mut self, watcher: ChangeWatcher) -> Self {
        self.watcher = watcher;
        self
    }

    /// Whether the running executable counts as a dependency.
    pub fn track_exe(mut self, track: bool) -> Self {
        self.track_exe = track;
        self
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn program_id(&self) -> &ProgramId {
        &self.program_id
    }

    pub fn errors(&self) -> &[RespawnError] {
        &self.errors
    }

    pub fn required_paths(&self) -> &BTreeSet<PathBuf> {
        &self.required_paths
    }

    pub fn error_paths(&self) -> &BTreeSet<PathBuf> {
        &self.error_paths
    }

    pub fn has_initial_state(&self) -> bool {
        matches!(self.role, ProcessRole::Respawned { .. })
    }

    /// Replace the program id with the snapshot left by the previous
    /// incarnation. Without one, the current program id is returned as is.
    pub fn load_initial_state(&mut self) -> Result<&ProgramId> {
        let ProcessRole::Respawned { state_fd } = self.role else {
            return Ok(&self.program_id);
        };
        let file = File::from(adopt_fd(state_fd)?);
        let program_id: ProgramId = serde_json::from_reader(std::io::BufReader::new(file))?;
        debug!(
            files = program_id.len(),
            absent = program_id.absent_paths().count(),
            "loaded initial state"
        );
        self.program_id = program_id;
        Ok(&self.program_id)
    }

    /// Run `load`, recording the files it declares.
    ///
    /// An error is kept rather than returned: the program still starts and
    /// waits for the failing files to change.
    pub fn requires<F>(&mut self, load: F) -> bool
    where
        F: FnOnce(&mut Loader<'_>) -> Result<()>,
    {
        let mut loader = Loader {
            search_path: &self.search_path,
            loaded: Vec::new(),
            failed: Vec::new(),
        };
        let outcome = load(&mut loader);
        let Loader { loaded, failed, .. } = loader;

        self.required_paths.extend(loaded);
        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, paths = ?failed, "error while loading");
                self.error_paths.extend(failed);
                self.errors.push(e);
                false
            }
        }
    }

    /// Register a callback run just before re-executing, once the work has
    /// run and a change was seen.
    pub fn at_respawn(&mut self, handler: impl FnMut() + 'static) {
        self.respawn_handlers.push(Box::new(handler));
    }

    /// Required paths, error paths, and the executable when tracked.
    pub fn currently_loaded_files(&self) -> BTreeSet<PathBuf> {
        let mut files: BTreeSet<PathBuf> = self
            .required_paths
            .union(&self.error_paths)
            .cloned()
            .collect();
        if self.track_exe {
            match std::env::current_exe() {
                Ok(exe) => {
                    files.insert(exe);
                }
                Err(e) => debug!(error = %e, "cannot locate own executable"),
            }
        }
        files
    }

    /// Snapshot `files` into an unlinked temporary file, rewound to the
    /// start and ready to be inherited.
    pub fn dump_initial_state<I, P>(&self, files: I) -> Result<File>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut program_id = ProgramId::with_policy(self.policy.clone());
        for file in files {
            let file = file.as_ref();
            match program_id.register_file(file, &self.search_path) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => program_id.register_absent(file)?,
                Err(e) => return Err(e),
            }
        }

        let out = snapshot_file(&program_id)?;
        debug!(
            files = program_id.len(),
            id = program_id.id(),
            "dumped initial state"
        );
        Ok(out)
    }

    fn untracked<'a>(&self, files: &'a BTreeSet<PathBuf>) -> Vec<&'a PathBuf> {
        files
            .iter()
            .filter(|p| {
                !self.program_id.include(p, &self.search_path) && !self.program_id.is_absent(p)
            })
            .collect()
    }

    /// Do the program's work and re-exec when needed.
    ///
    /// `command` defaults to the current executable and arguments. Outside
    /// slave role this only returns on error. In slave role the work runs
    /// once and its exit code is returned.
    pub fn run<F>(&mut self, command: Option<Vec<String>>, work: F) -> Result<i32>
    where
        F: FnOnce(&mut WorkContext) -> anyhow::Result<()>,
    {
        if self.role.is_slave() {
            return self.run_as_slave(work);
        }

        if self.has_initial_state() {
            if let Err(e) = self.load_initial_state() {
                warn!(error = %e, "cannot load initial state; starting fresh");
            }
        }

        let mut all_files = self.currently_loaded_files();
        let untracked = self.untracked(&all_files);

        if untracked.is_empty() && !self.program_id.changed() {
            if self.errors.is_empty() {
                let mut ctx = WorkContext::default();
                match work(&mut ctx) {
                    Ok(()) => info!(exit_code = ctx.exit_code, "work finished"),
                    Err(e) => error!("work failed: {e:#}"),
                }
                for path in ctx.tracked {
                    if let Err(e) = self.program_id.register_file(&path, &self.search_path) {
                        debug!(?path, error = %e, "cannot track path declared by work");
                    }
                    all_files.insert(path);
                }
            } else {
                warn!(
                    errors = self.errors.len(),
                    "errors while loading, waiting for changes"
                );
            }

            self.watcher.wait(&self.program_id);
            info!("change detected");
            for handler in self.respawn_handlers.iter_mut() {
                handler();
            }
        } else {
            debug!(untracked = ?untracked, "re-executing to track all files");
        }

        let state = self.dump_initial_state(&all_files)?;
        Err(self.exec(command, &state))
    }

    fn exec(&self, command: Option<Vec<String>>, state: &File) -> RespawnError {
        let command = match command {
            Some(c) if !c.is_empty() => c,
            _ => match std::env::current_exe() {
                Ok(exe) => std::iter::once(exe.display().to_string())
                    .chain(std::env::args().skip(1))
                    .collect(),
                Err(e) => return e.into(),
            },
        };
        let Some((program, args)) = command.split_first() else {
            return RespawnError::ConfigError("empty respawn command".to_string());
        };

        let fd = state.as_raw_fd();
        let mut cmd = Command::new(program);
        cmd.args(args).env(INITIAL_STATE_ENV, fd.to_string());
        // SAFETY: the hook only calls fcntl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || clear_cloexec(fd));
        }

        info!(program = %program, "respawning");
        cmd.exec().into()
    }

    fn run_as_slave<F>(&mut self, work: F) -> Result<i32>
    where
        F: FnOnce(&mut WorkContext) -> anyhow::Result<()>,
    {
        let session = SlaveSession::open(&self.role)?;
        self.program_id = session.program_id().clone();
        debug!(name = session.name().unwrap_or("-"), "running as slave");

        let mut ctx = WorkContext::default();
        if self.errors.is_empty() {
            if let Err(e) = work(&mut ctx) {
                error!("work failed: {e:#}");
                if ctx.exit_code == 0 {
                    ctx.exit_code = 1;
                }
            }
        } else {
            warn!(errors = self.errors.len(), "errors while loading; reporting files only");
            ctx.exit_code = 1;
        }

        let mut files = self.currently_loaded_files();
        files.extend(std::mem::take(&mut ctx.tracked));
        session.report(std::mem::take(&mut ctx.subcommands), files.into_iter().collect())?;
        Ok(ctx.exit_code)
    }
}
