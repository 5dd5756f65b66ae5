// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::SpawnOptions;
use crate::watch::{ChangeWatcher, HashPolicy};

/// Raw top-level configuration as read from a TOML file.
///
/// ```toml
/// [manager]
/// parallel_level = 2
/// seed = ["Cargo.lock"]
///
/// [watch]
/// debounce_ms = 200
///
/// [slave.build]
/// cmd = ["make", "all"]
/// ```
///
/// All sections are optional and have reasonable defaults. Turn it into a
/// [`ConfigFile`] with `ConfigFile::try_from` to get a validated config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub manager: ManagerSection,

    #[serde(default)]
    pub watch: WatchSection,

    /// All slaves from `[slave.<name>]`, keyed by name.
    #[serde(default)]
    pub slave: BTreeMap<String, SlaveConfig>,
}

/// Validated configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub manager: ManagerSection,
    pub watch: WatchSection,
    pub slave: BTreeMap<String, SlaveConfig>,
}

impl ConfigFile {
    /// Build without validation. Used by `TryFrom<RawConfigFile>` once the
    /// checks passed.
    pub(crate) fn new_unchecked(
        manager: ManagerSection,
        watch: WatchSection,
        slave: BTreeMap<String, SlaveConfig>,
    ) -> Self {
        Self {
            manager,
            watch,
            slave,
        }
    }
}

/// `[manager]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerSection {
    /// Maximum number of slaves running at once.
    #[serde(default = "default_parallel_level")]
    pub parallel_level: usize,

    /// Delay between two scheduling passes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Files every slave starts out tracking.
    #[serde(default)]
    pub seed: Vec<PathBuf>,
}

fn default_parallel_level() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_debounce_ms() -> u64 {
    200
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            parallel_level: default_parallel_level(),
            poll_interval_ms: default_poll_interval_ms(),
            seed: Vec::new(),
        }
    }
}

/// `[watch]` section: how changes are detected.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a detected change must persist before it counts.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Extensions hashed after whitespace normalization. `None` keeps the
    /// built-in list.
    #[serde(default)]
    pub text_extensions: Option<Vec<String>>,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
            text_extensions: None,
        }
    }
}

impl WatchSection {
    pub fn hash_policy(&self) -> HashPolicy {
        match &self.text_extensions {
            Some(exts) => HashPolicy::with_text_extensions(exts),
            None => HashPolicy::default(),
        }
    }

    pub fn watcher(&self) -> ChangeWatcher {
        ChangeWatcher::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_millis(self.debounce_ms),
        )
    }
}

/// `[slave.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SlaveConfig {
    /// Program and arguments; not run through a shell.
    pub cmd: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory of the child. Also searched first when resolving
    /// the files it reports.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Spawn this slave first, whatever its tracked files say.
    #[serde(default)]
    pub queued: bool,

    #[serde(default)]
    pub process_group: bool,
}

impl SlaveConfig {
    pub fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            env: self.env.clone(),
            current_dir: self.cwd.clone(),
            process_group: self.process_group,
        }
    }
}
