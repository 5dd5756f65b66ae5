// src/watch/tracked_file.rs

use std::collections::BTreeSet;
use std::path::Path;

use crate::exec::SlaveId;
use crate::watch::file_record::{FileCheck, FileRecord};
use crate::watch::hash::HashPolicy;

/// A file watched by the manager on behalf of one or more slaves.
///
/// Lets the manager stat a shared dependency once per poll instead of once
/// per interested slave.
#[derive(Debug, Clone)]
pub struct TrackedFile {
    record: FileRecord,
    slaves: BTreeSet<SlaveId>,
}

impl TrackedFile {
    pub fn new(record: FileRecord) -> Self {
        Self {
            record,
            slaves: BTreeSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.record.path
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn slaves(&self) -> &BTreeSet<SlaveId> {
        &self.slaves
    }

    pub fn add_slave(&mut self, slave: SlaveId) {
        self.slaves.insert(slave);
    }

    pub fn retain_slaves(&mut self, keep: impl FnMut(&SlaveId) -> bool) {
        self.slaves.retain(keep);
    }

    pub fn has_slaves(&self) -> bool {
        !self.slaves.is_empty()
    }

    /// Check the file against disk.
    ///
    /// Returns `true` if it changed (deleted, or different content). A
    /// stat-only difference is absorbed into the stored record.
    pub fn update(&mut self, policy: &HashPolicy) -> bool {
        match self.record.check(policy) {
            FileCheck::Unchanged => false,
            FileCheck::Touched(stat) => {
                self.record.stat = stat;
                false
            }
            FileCheck::Modified(_) | FileCheck::Missing => true,
        }
    }

    /// Add `slave`, whose `record` was taken when it just finished.
    ///
    /// If the content differs from the stored record, the slaves already
    /// interested ran against an older version: they are returned, and the
    /// entry restarts from `record` with `slave` alone.
    pub fn join(&mut self, slave: SlaveId, record: FileRecord) -> Vec<SlaveId> {
        if record.content_id == self.record.content_id {
            self.slaves.insert(slave);
            return Vec::new();
        }
        let stale = std::mem::take(&mut self.slaves)
            .into_iter()
            .filter(|s| *s != slave)
            .collect();
        self.record = record;
        self.slaves.insert(slave);
        stale
    }
}
