#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use respawn::config::{ConfigFile, ManagerSection, RawConfigFile, SlaveConfig, WatchSection};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                manager: ManagerSection::default(),
                watch: WatchSection::default(),
                slave: BTreeMap::new(),
            },
        }
    }

    pub fn with_slave(mut self, name: &str, slave: SlaveConfig) -> Self {
        self.config.slave.insert(name.to_string(), slave);
        self
    }

    pub fn with_parallel_level(mut self, level: usize) -> Self {
        self.config.manager.parallel_level = level;
        self
    }

    pub fn with_seed(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.manager.seed.push(path.into());
        self
    }

    pub fn with_text_extensions(mut self, exts: &[&str]) -> Self {
        self.config.watch.text_extensions = Some(exts.iter().map(|e| e.to_string()).collect());
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `SlaveConfig`.
pub struct SlaveConfigBuilder {
    slave: SlaveConfig,
}

impl SlaveConfigBuilder {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            slave: SlaveConfig {
                cmd: cmd.into_iter().map(Into::into).collect(),
                env: BTreeMap::new(),
                cwd: None,
                queued: false,
                process_group: false,
            },
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.slave.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.slave.cwd = Some(dir.into());
        self
    }

    pub fn queued(mut self, queued: bool) -> Self {
        self.slave.queued = queued;
        self
    }

    pub fn build(self) -> SlaveConfig {
        self.slave
    }
}
