// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{RespawnError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = RespawnError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.manager, raw.watch, raw.slave))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_manager(cfg)?;
    validate_watch(cfg)?;
    validate_slaves(cfg)?;
    Ok(())
}

/// The `manager` command has nothing to do without slaves.
pub fn ensure_has_slaves(cfg: &ConfigFile) -> Result<()> {
    if cfg.slave.is_empty() {
        return Err(RespawnError::ConfigError(
            "config must contain at least one [slave.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_manager(cfg: &RawConfigFile) -> Result<()> {
    if cfg.manager.parallel_level == 0 {
        return Err(RespawnError::ConfigError(
            "[manager].parallel_level must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.manager.poll_interval_ms == 0 {
        return Err(RespawnError::ConfigError(
            "[manager].poll_interval_ms must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_watch(cfg: &RawConfigFile) -> Result<()> {
    if cfg.watch.poll_interval_ms == 0 {
        return Err(RespawnError::ConfigError(
            "[watch].poll_interval_ms must be > 0".to_string(),
        ));
    }
    if let Some(exts) = &cfg.watch.text_extensions {
        if let Some(bad) = exts
            .iter()
            .find(|e| e.trim().trim_start_matches('.').is_empty())
        {
            return Err(RespawnError::ConfigError(format!(
                "[watch].text_extensions contains an empty extension ({bad:?})"
            )));
        }
    }
    Ok(())
}

fn validate_slaves(cfg: &RawConfigFile) -> Result<()> {
    for (name, slave) in cfg.slave.iter() {
        match slave.cmd.first() {
            None => {
                return Err(RespawnError::ConfigError(format!(
                    "slave '{name}' has an empty `cmd`"
                )));
            }
            Some(program) if program.trim().is_empty() => {
                return Err(RespawnError::ConfigError(format!(
                    "slave '{name}' has an empty program name in `cmd`"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}
