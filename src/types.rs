// src/types.rs

//! Launch parameters and wire payloads shared by the manager and its
//! children.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::watch::ProgramId;

/// How a child process is launched, besides its command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory; inherits the manager's when `None`.
    #[serde(default)]
    pub current_dir: Option<PathBuf>,

    /// Put the child in its own process group.
    #[serde(default)]
    pub process_group: bool,
}

impl SpawnOptions {
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// A further job a slave asks its manager to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subcommand {
    #[serde(default)]
    pub name: Option<String>,
    pub cmdline: Vec<String>,
    #[serde(default)]
    pub options: SpawnOptions,
}

impl Subcommand {
    pub fn new<I, S>(name: Option<String>, cmdline: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name,
            cmdline: cmdline.into_iter().map(Into::into).collect(),
            options: SpawnOptions::default(),
        }
    }
}

/// Payload written by the manager into a child's initial-state channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialState {
    pub name: Option<String>,
    pub program_id: ProgramId,
}

/// Payload written by a child into its result channel before exiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveReport {
    #[serde(default)]
    pub subcommands: Vec<Subcommand>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
}
