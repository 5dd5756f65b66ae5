// src/errors.rs

//! Crate-wide error type and result alias.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RespawnError {
    /// A registered path could not be resolved on disk.
    ///
    /// `search_path` is empty when `path` was absolute.
    #[error("cannot find {path:?}{}", describe_search_path(.search_path))]
    FileNotFound {
        path: PathBuf,
        search_path: Vec<PathBuf>,
    },

    /// `spawn` was called on a slave whose process is still alive.
    #[error("cannot spawn {0}: already running")]
    AlreadyRunning(String),

    /// A query that needs an exit status was made before the slave finished.
    #[error("{0} has not finished yet")]
    NotFinished(String),

    /// A slave-mode operation was invoked outside of a slave process.
    #[error("not running as a slave of a respawn manager")]
    NotSlave,

    /// The slave cannot be removed from the manager while it is active.
    #[error("cannot remove {0}: it is currently running")]
    SlaveActive(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("invalid state payload: {0}")]
    PayloadError(#[from] serde_json::Error),

    #[error("OS error: {0}")]
    OsError(#[from] nix::errno::Errno),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn describe_search_path(search_path: &[PathBuf]) -> String {
    if search_path.is_empty() {
        String::new()
    } else {
        let joined: Vec<String> = search_path
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!(" in {}", joined.join(", "))
    }
}

impl RespawnError {
    /// Whether this error means "the file is not there" as opposed to a
    /// genuine IO or protocol failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            RespawnError::FileNotFound { .. } => true,
            RespawnError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, RespawnError>;
