// src/watch/file_record.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::watch::hash::HashPolicy;

/// Cheap stat snapshot used as a pre-filter before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub mtime: SystemTime,
    pub size: u64,
}

impl FileStat {
    pub fn of(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            mtime: meta.modified()?,
            size: meta.len(),
        })
    }
}

/// One tracked file: where it is, what it looked like, what it contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub stat: FileStat,
    pub content_id: String,
}

/// Result of comparing a record against the file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCheck {
    /// Stat identical; content was not looked at.
    Unchanged,
    /// Stat differs but the content id is the same (e.g. `touch`).
    Touched(FileStat),
    /// Content differs.
    Modified(FileRecord),
    /// The file no longer exists or cannot be read.
    Missing,
}

impl FileCheck {
    pub fn is_change(&self) -> bool {
        matches!(self, FileCheck::Modified(_) | FileCheck::Missing)
    }
}

impl FileRecord {
    /// Stat and hash `path` (which must already be resolved).
    pub fn load(path: &Path, policy: &HashPolicy) -> Result<Self> {
        let stat = FileStat::of(path)?;
        let content_id = policy.content_id(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            stat,
            content_id,
        })
    }

    /// Two-tier comparison against the live file: stat first, content only
    /// when the stat differs.
    pub fn check(&self, policy: &HashPolicy) -> FileCheck {
        let stat = match FileStat::of(&self.path) {
            Ok(stat) => stat,
            Err(_) => return FileCheck::Missing,
        };
        if stat == self.stat {
            return FileCheck::Unchanged;
        }
        match policy.content_id(&self.path) {
            Ok(content_id) if content_id == self.content_id => FileCheck::Touched(stat),
            Ok(content_id) => FileCheck::Modified(FileRecord {
                path: self.path.clone(),
                stat,
                content_id,
            }),
            Err(_) => FileCheck::Missing,
        }
    }
}
