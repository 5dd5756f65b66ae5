// src/watch/program_id.rs

//! The set of files a program (or a unit of work) depends on.

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::errors::{RespawnError, Result};
use crate::watch::file_record::{FileCheck, FileRecord, FileStat};
use crate::watch::hash::{HashPolicy, compute_aggregate_hash};

/// Aggregate fingerprint and file-set tracker.
///
/// Records are keyed by resolved path; registering the same path twice
/// updates the record in place. The aggregate [`ProgramId::id`] is computed
/// lazily over the path-sorted records and invalidated on every mutation
/// that can affect it.
///
/// Besides real records, a program id can remember *absent* paths: files
/// the program asked for but that did not exist. Their later appearance
/// counts as a change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramId {
    files: BTreeMap<PathBuf, FileRecord>,
    #[serde(default)]
    absent: BTreeSet<PathBuf>,
    #[serde(default)]
    policy: HashPolicy,
    #[serde(skip)]
    id: OnceCell<String>,
}

impl PartialEq for ProgramId {
    fn eq(&self, other: &Self) -> bool {
        self.files == other.files && self.absent == other.absent
    }
}

impl Eq for ProgramId {}

/// Search path used when the caller has none: the current directory.
pub fn default_search_path() -> Vec<PathBuf> {
    std::env::current_dir().map(|d| vec![d]).unwrap_or_default()
}

/// Resolve a possibly-relative path into an absolute one.
///
/// Relative paths are tried against each entry of `search_path` in order;
/// absolute paths must exist.
pub fn resolve_file_path(path: &Path, search_path: &[PathBuf]) -> Result<PathBuf> {
    if path.is_absolute() {
        if !path.exists() {
            return Err(RespawnError::FileNotFound {
                path: path.to_path_buf(),
                search_path: Vec::new(),
            });
        }
        return Ok(path.to_path_buf());
    }

    for dir in search_path {
        let full = dir.join(path);
        if full.exists() {
            return Ok(std::path::absolute(&full)?);
        }
    }

    Err(RespawnError::FileNotFound {
        path: path.to_path_buf(),
        search_path: search_path.to_vec(),
    })
}

impl ProgramId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: HashPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> &HashPolicy {
        &self.policy
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Remove all tracked files and absent paths.
    pub fn clear(&mut self) {
        self.files.clear();
        self.absent.clear();
        self.invalidate();
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    /// Whether `path`, once resolved, is tracked.
    pub fn include(&self, path: &Path, search_path: &[PathBuf]) -> bool {
        resolve_file_path(path, search_path)
            .map(|p| self.files.contains_key(&p))
            .unwrap_or(false)
    }

    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn tracked_paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    pub fn absent_paths(&self) -> impl Iterator<Item = &Path> {
        self.absent.iter().map(PathBuf::as_path)
    }

    pub fn is_absent(&self, path: &Path) -> bool {
        self.absent.contains(path)
    }

    /// Remember a path that could not be found.
    pub fn register_absent(&mut self, path: &Path) -> Result<()> {
        let path = std::path::absolute(path)?;
        if !self.files.contains_key(&path) {
            self.absent.insert(path);
        }
        Ok(())
    }

    /// Resolve a list of paths, optionally skipping the ones that cannot be
    /// found.
    pub fn resolve_file_list<I, P>(
        &self,
        files: I,
        search_path: &[PathBuf],
        ignore_not_found: bool,
    ) -> Result<Vec<PathBuf>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut resolved = Vec::new();
        for file in files {
            match resolve_file_path(file.as_ref(), search_path) {
                Ok(path) => resolved.push(path),
                Err(e) if ignore_not_found && e.is_not_found() => {
                    trace!("ignoring unresolvable path {:?}", file.as_ref());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }

    /// Register one file.
    ///
    /// Returns the resolved path if the registration changed the program
    /// id (new file, or content differing from the stored record), `None`
    /// otherwise. A stat-only difference updates the stored stat in place
    /// and reports no change.
    pub fn register_file(&mut self, path: &Path, search_path: &[PathBuf]) -> Result<Option<PathBuf>> {
        let resolved = resolve_file_path(path, search_path)?;
        let stat = FileStat::of(&resolved)?;

        if let Some(existing) = self.files.get(&resolved) {
            if existing.stat == stat {
                return Ok(None);
            }
        }

        let content_id = self.policy.content_id(&resolved)?;
        self.absent.remove(&resolved);

        let unchanged = self
            .files
            .get(&resolved)
            .is_some_and(|existing| existing.content_id == content_id);

        self.files.insert(
            resolved.clone(),
            FileRecord {
                path: resolved.clone(),
                stat,
                content_id,
            },
        );

        if unchanged {
            trace!("{:?} touched without content change", resolved);
            return Ok(None);
        }

        self.invalidate();
        debug!("registered {:?}", resolved);
        Ok(Some(resolved))
    }

    /// Register a batch of files, returning the paths that changed the
    /// program id.
    ///
    /// With `ignore_not_found`, files that cannot be resolved are skipped
    /// silently; other IO errors still propagate.
    pub fn register_files<I, P>(
        &mut self,
        files: I,
        search_path: &[PathBuf],
        ignore_not_found: bool,
    ) -> Result<Vec<PathBuf>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut modified = Vec::new();
        for file in files {
            match self.register_file(file.as_ref(), search_path) {
                Ok(Some(path)) => modified.push(path),
                Ok(None) => {}
                Err(e) if ignore_not_found && e.is_not_found() => {
                    trace!("ignoring unresolvable path {:?}", file.as_ref());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(modified)
    }

    /// Copy of `self` restricted to the given files.
    pub fn slice<I, P>(
        &self,
        files: I,
        search_path: &[PathBuf],
        ignore_not_found: bool,
    ) -> Result<ProgramId>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let keep: BTreeSet<PathBuf> = self
            .resolve_file_list(files, search_path, ignore_not_found)?
            .into_iter()
            .collect();

        let mut result = self.clone();
        result.files.retain(|path, _| keep.contains(path));
        result.invalidate();
        Ok(result)
    }

    /// Merge another program id into `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: &ProgramId) -> &mut Self {
        for (path, record) in &other.files {
            self.absent.remove(path);
            self.files.insert(path.clone(), record.clone());
        }
        for path in &other.absent {
            if !self.files.contains_key(path) {
                self.absent.insert(path.clone());
            }
        }
        self.invalidate();
        self
    }

    /// Bring every record up to date with the disk, dropping files that
    /// disappeared.
    pub fn refresh(&mut self) {
        let mut updated = BTreeMap::new();
        for (path, record) in std::mem::take(&mut self.files) {
            match record.check(&self.policy) {
                FileCheck::Unchanged => {
                    updated.insert(path, record);
                }
                FileCheck::Touched(stat) => {
                    updated.insert(path, FileRecord { stat, ..record });
                }
                FileCheck::Modified(fresh) => {
                    updated.insert(path, fresh);
                }
                FileCheck::Missing => debug!("{:?} disappeared; dropping it", path),
            }
        }
        self.files = updated;
        self.absent.retain(|p| !p.exists());
        self.invalidate();
    }

    /// Deterministic id of the tracked set: independent of registration
    /// order, sensitive to both the set of paths and their contents.
    pub fn id(&self) -> &str {
        self.id.get_or_init(|| {
            compute_aggregate_hash(
                self.files
                    .values()
                    .map(|r| (r.path.as_path(), r.content_id.as_str())),
            )
        })
    }

    /// Whether the disk no longer matches the stored state.
    ///
    /// A deleted file is always a change. A stat difference is only a change
    /// when the content id differs too. An absent path that now exists is a
    /// change.
    pub fn changed(&self) -> bool {
        if let Some(path) = self.absent.iter().find(|p| p.exists()) {
            debug!("previously missing {:?} appeared", path);
            return true;
        }

        for record in self.files.values() {
            match record.check(&self.policy) {
                FileCheck::Missing => {
                    debug!("{:?} is missing", record.path);
                    return true;
                }
                FileCheck::Modified(_) => {
                    debug!("{:?} content changed", record.path);
                    return true;
                }
                FileCheck::Unchanged | FileCheck::Touched(_) => {}
            }
        }
        false
    }

    fn invalidate(&mut self) {
        self.id.take();
    }
}
