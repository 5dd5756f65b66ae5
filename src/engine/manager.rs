// src/engine/manager.rs

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::engine::hooks::Hooks;
use crate::errors::{RespawnError, Result};
use crate::exec::{Slave, SlaveId};
use crate::types::SpawnOptions;
use crate::watch::{ProgramId, TrackedFile, default_search_path};

pub const DEFAULT_MANAGER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a single [`Manager::poll`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Slaves spawned during this poll, in spawn order.
    pub started: Vec<SlaveId>,
    /// Slaves reaped during this poll.
    pub finished: Vec<SlaveId>,
}

/// Bounded-parallelism scheduler over a set of slaves.
///
/// The manager's own process is represented by a pseudo-slave that is
/// always active: it occupies one entry of the active map and one slot of
/// the `parallel_level + 1` budget, so `parallel_level` counts real
/// workers only.
///
/// All state is touched from the polling thread only.
#[derive(Debug)]
pub struct Manager {
    parallel_level: usize,
    poll_interval: Duration,
    workers: Vec<Slave>,
    active: HashMap<Pid, SlaveId>,
    queued: VecDeque<SlaveId>,
    tracked_files: BTreeMap<PathBuf, TrackedFile>,
    seed: ProgramId,
    self_id: SlaveId,
    hooks: Hooks,
}

impl Manager {
    pub fn new(parallel_level: usize) -> Self {
        Self::with_seed(parallel_level, ProgramId::new())
    }

    /// Create a manager whose slaves all start out from a copy of `seed`.
    pub fn with_seed(parallel_level: usize, seed: ProgramId) -> Self {
        let self_slave = Slave::for_self(&seed);
        let self_id = self_slave.id();
        let mut active = HashMap::new();
        active.insert(Pid::this(), self_id);

        Self {
            parallel_level,
            poll_interval: DEFAULT_MANAGER_POLL_INTERVAL,
            workers: vec![self_slave],
            active,
            queued: VecDeque::new(),
            tracked_files: BTreeMap::new(),
            seed,
            self_id,
            hooks: Hooks::default(),
        }
    }

    /// Build a manager from a validated config: seed files, slaves, and the
    /// slaves to queue up front.
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        let mut seed = ProgramId::with_policy(cfg.watch.hash_policy());
        let added = seed.register_files(&cfg.manager.seed, &default_search_path(), true)?;
        debug!(files = added.len(), "registered manager seed");

        let mut manager = Manager::with_seed(cfg.manager.parallel_level, seed)
            .with_poll_interval(Duration::from_millis(cfg.manager.poll_interval_ms));

        for (name, slave_cfg) in cfg.slave.iter() {
            let id = manager.add_slave(
                slave_cfg.cmd.clone(),
                Some(name.clone()),
                slave_cfg.spawn_options(),
            );
            if slave_cfg.queued {
                manager.queue(id);
            }
        }
        Ok(manager)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn parallel_level(&self) -> usize {
        self.parallel_level
    }

    pub fn set_parallel_level(&mut self, level: usize) {
        self.parallel_level = level;
    }

    pub fn seed(&self) -> &ProgramId {
        &self.seed
    }

    pub fn seed_mut(&mut self) -> &mut ProgramId {
        &mut self.seed
    }

    /// Id of the pseudo-slave standing for the manager process.
    pub fn self_id(&self) -> SlaveId {
        self.self_id
    }

    pub fn self_slave(&self) -> Option<&Slave> {
        self.slave(self.self_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Slave> {
        self.workers.iter()
    }

    pub fn slave(&self, id: SlaveId) -> Option<&Slave> {
        self.workers.iter().find(|s| s.id() == id)
    }

    pub fn slave_mut(&mut self, id: SlaveId) -> Option<&mut Slave> {
        self.workers.iter_mut().find(|s| s.id() == id)
    }

    fn index_of(&self, id: SlaveId) -> Option<usize> {
        self.workers.iter().position(|s| s.id() == id)
    }

    /// Number of active entries, including the manager itself.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SlaveId) -> bool {
        self.active.values().any(|a| *a == id)
    }

    pub fn active_slaves(&self) -> impl Iterator<Item = &Slave> {
        self.workers.iter().filter(|s| self.is_active(s.id()))
    }

    pub fn queued(&self) -> impl Iterator<Item = SlaveId> + '_ {
        self.queued.iter().copied()
    }

    pub fn tracked_files(&self) -> &BTreeMap<PathBuf, TrackedFile> {
        &self.tracked_files
    }

    /// Declare a new worker, seeded from the manager's seed.
    pub fn add_slave<I, S>(&mut self, cmdline: I, name: Option<String>, options: SpawnOptions) -> SlaveId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut slave = Slave::new(cmdline).with_options(options);
        if let Some(name) = name {
            slave = slave.with_name(name);
        }
        self.insert_slave(slave)
    }

    /// Declare an already-built worker. Its program id is layered on top of
    /// a copy of the seed.
    pub fn insert_slave(&mut self, mut slave: Slave) -> SlaveId {
        let mut program_id = self.seed.clone();
        program_id.merge(slave.program_id());
        *slave.program_id_mut() = program_id;

        let id = slave.id();
        debug!(slave = %slave, "adding slave");
        self.hooks.slave_new(&slave);
        self.workers.push(slave);
        id
    }

    /// Forget about a worker. Refuses while it is running.
    pub fn remove_slave(&mut self, id: SlaveId) -> Result<Slave> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| RespawnError::Other(anyhow::anyhow!("unknown slave {id}")))?;
        if self.is_active(id) || self.workers[idx].is_running() {
            return Err(RespawnError::SlaveActive(self.workers[idx].to_string()));
        }

        let slave = self.workers.remove(idx);
        self.queued.retain(|q| *q != id);
        self.tracked_files.retain(|_, tracked| {
            tracked.retain_slaves(|s| *s != id);
            tracked.has_slaves()
        });
        debug!(slave = %slave, "removed slave");
        self.hooks.slave_removed(&slave);
        Ok(slave)
    }

    /// Put a worker in front of the automatic selection.
    pub fn queue(&mut self, id: SlaveId) {
        if let Some(slave) = self.slave_mut(id) {
            slave.mark_needed();
            if !self.queued.contains(&id) {
                self.queued.push_back(id);
            }
        }
    }

    pub fn on_slave_new(&mut self, mut cb: impl FnMut(&Slave) + 'static) {
        for slave in &self.workers {
            cb(slave);
        }
        self.hooks.add_new(Box::new(cb));
    }

    pub fn on_slave_start(&mut self, mut cb: impl FnMut(&Slave) + 'static) {
        for slave in self.workers.iter().filter(|s| self.active.values().any(|a| *a == s.id())) {
            cb(slave);
        }
        self.hooks.add_started(Box::new(cb));
    }

    pub fn on_slave_finished(&mut self, cb: impl FnMut(&Slave) + 'static) {
        self.hooks.add_finished(Box::new(cb));
    }

    pub fn on_slave_removed(&mut self, cb: impl FnMut(&Slave) + 'static) {
        self.hooks.add_removed(Box::new(cb));
    }

    /// Reap finished children without blocking.
    ///
    /// Only the manager's own active slaves are waited for, so unrelated
    /// children of this process are left alone.
    pub fn collect_finished_slaves(&mut self) -> Result<Vec<SlaveId>> {
        let candidates: Vec<(Pid, SlaveId)> = self
            .active
            .iter()
            .filter(|(_, id)| **id != self.self_id)
            .map(|(pid, id)| (*pid, *id))
            .collect();

        let mut finished = Vec::new();
        for (pid, id) in candidates {
            let Some(idx) = self.index_of(id) else {
                self.active.remove(&pid);
                continue;
            };

            let slave = &mut self.workers[idx];
            slave.poll_result();
            let Some(status) = slave.try_wait()? else {
                continue;
            };

            self.active.remove(&pid);
            let modified = slave.finished(status);
            let mut stale = Vec::new();
            if modified.is_empty() {
                slave.mark_not_needed();
                let records: Vec<_> = slave.program_id().records().cloned().collect();
                for record in records {
                    match self.tracked_files.get_mut(&record.path) {
                        Some(tracked) => stale.extend(tracked.join(id, record)),
                        None => {
                            let mut tracked = TrackedFile::new(record);
                            tracked.add_slave(id);
                            self.tracked_files.insert(tracked.path().to_path_buf(), tracked);
                        }
                    }
                }
            }
            for stale_id in stale {
                if let Some(stale_slave) = self.slave_mut(stale_id) {
                    debug!(slave = %stale_slave, "shared file changed since its last run");
                    stale_slave.mark_needed();
                }
            }

            let subcommands = self.workers[idx].subcommands().to_vec();
            self.hooks.slave_finished(&self.workers[idx]);

            for sub in subcommands {
                let known = self.workers.iter().any(|w| {
                    w.cmdline() == sub.cmdline.as_slice()
                        && w.name() == sub.name.as_deref()
                        && *w.options() == sub.options
                });
                if known {
                    debug!(cmdline = ?sub.cmdline, "subcommand already declared");
                    continue;
                }
                self.add_slave(sub.cmdline, sub.name, sub.options);
            }

            finished.push(id);
        }
        Ok(finished)
    }

    /// Fan shared tracked-file changes out to the interested slaves.
    fn update_tracked_files(&mut self) {
        let policy = self.seed.policy().clone();
        let workers = &self.workers;
        let mut triggered = Vec::new();

        self.tracked_files.retain(|path, tracked| {
            tracked.retain_slaves(|id| {
                workers
                    .iter()
                    .find(|s| s.id() == *id)
                    .is_some_and(|s| !s.needed())
            });
            if !tracked.has_slaves() {
                return false;
            }
            if tracked.update(&policy) {
                debug!(?path, slaves = tracked.slaves().len(), "tracked file changed");
                triggered.extend(tracked.slaves().iter().copied());
                return false;
            }
            true
        });

        for id in triggered {
            if let Some(slave) = self.slave_mut(id) {
                slave.mark_needed();
            }
        }
    }

    /// Pick the next slave to spawn: queued ones first, then (with
    /// `autospawn`) needed ones, previously failed before fresh. Slaves in
    /// `skip` are not considered.
    fn next_candidate(&mut self, autospawn: bool, skip: &HashSet<SlaveId>) -> Option<SlaveId> {
        self.queued.retain(|id| self.workers.iter().any(|s| s.id() == *id));
        let queued_pos = self.queued.iter().position(|id| {
            self.workers
                .iter()
                .find(|s| s.id() == *id)
                .is_some_and(|s| !s.is_running())
        });
        if let Some(pos) = queued_pos {
            return self.queued.remove(pos);
        }

        if !autospawn {
            return None;
        }

        let needed: Vec<&Slave> = self
            .workers
            .iter()
            .filter(|s| !s.is_running() && !skip.contains(&s.id()) && s.needed())
            .collect();
        needed
            .iter()
            .find(|s| s.is_finished() && matches!(s.success(), Ok(false)))
            .or_else(|| needed.first())
            .map(|s| s.id())
    }

    /// One scheduling pass: reap, propagate shared file changes, fill free
    /// slots.
    pub fn poll(&mut self, autospawn: bool) -> Result<PollOutcome> {
        let finished = self.collect_finished_slaves()?;
        self.update_tracked_files();

        let mut started = Vec::new();
        let mut failed = HashSet::new();
        while self.active.len() < self.parallel_level + 1 {
            let Some(id) = self.next_candidate(autospawn, &failed) else {
                break;
            };
            let Some(idx) = self.index_of(id) else {
                continue;
            };

            // Rotate the chosen slave to the back so ties are broken
            // round-robin.
            let slave = self.workers.remove(idx);
            self.workers.push(slave);
            let slave = self
                .workers
                .last_mut()
                .ok_or_else(|| RespawnError::Other(anyhow::anyhow!("worker list is empty")))?;

            match slave.spawn() {
                Ok(pid) => {
                    slave.mark_not_needed();
                    self.active.insert(pid, id);
                    self.hooks.slave_started(slave);
                    started.push(id);
                }
                Err(RespawnError::AlreadyRunning(what)) => {
                    warn!(slave = %what, "selected a slave that is already running");
                    failed.insert(id);
                }
                Err(e) => {
                    // Stays needed: the next poll tries again.
                    warn!(slave = %slave, error = %e, "failed to spawn slave");
                    slave.mark_needed();
                    failed.insert(id);
                }
            }
        }

        if !started.is_empty() || !finished.is_empty() {
            debug!(
                started = started.len(),
                finished = finished.len(),
                active = self.active.len(),
                "poll"
            );
        }
        Ok(PollOutcome { started, finished })
    }

    /// Kill every active slave and wait for it.
    pub fn kill_active(&mut self) {
        let ids: Vec<SlaveId> = self
            .active
            .values()
            .copied()
            .filter(|id| *id != self.self_id)
            .collect();

        for id in ids {
            if let Some(slave) = self.slave_mut(id) {
                info!(slave = %slave, "killing active slave");
                if let Err(e) = slave.kill(Signal::SIGTERM, true) {
                    warn!(slave = %slave, error = %e, "failed to kill slave");
                }
            }
        }
        let self_id = self.self_id;
        self.active.retain(|_, id| *id == self_id);
    }

    /// Poll until `shutdown` resolves or a poll fails. Active slaves are
    /// killed on the way out in both cases.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            parallel_level = self.parallel_level,
            workers = self.workers.len() - 1,
            "manager started"
        );
        tokio::pin!(shutdown);

        let result = loop {
            if let Err(e) = self.poll(true) {
                break Err(e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
            }
        };

        self.kill_active();
        info!("manager exiting");
        result
    }

    /// Poll until Ctrl-C or SIGTERM.
    pub async fn run(&mut self) -> Result<()> {
        // Installed before the first poll so an early SIGTERM is not missed.
        let sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => Some(sigterm),
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                None
            }
        };
        self.run_until(shutdown_signal(sigterm)).await
    }
}

/// Resolves on the first Ctrl-C or SIGTERM. A signal that cannot be
/// listened for never fires.
async fn shutdown_signal(sigterm: Option<tokio::signal::unix::Signal>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match sigterm {
            Some(mut sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
