// src/supervisor/role.rs

//! Which side of the respawn protocols the current process is on.

use std::collections::BTreeSet;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use tracing::warn;

use crate::errors::{RespawnError, Result};
use crate::exec::channel::set_cloexec;
use crate::exec::{INITIAL_STATE_ENV, SLAVE_INITIAL_STATE_ENV, SLAVE_RESULT_ENV};

/// How this process was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Started by hand.
    Standalone,
    /// Re-executed by itself; `state_fd` holds the previous snapshot.
    Respawned { state_fd: RawFd },
    /// Spawned by a manager as one of its slaves.
    Slave {
        initial_state_fd: RawFd,
        result_fd: RawFd,
    },
}

impl ProcessRole {
    /// Read the role from this process' environment.
    pub fn detect() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Decide the role from an environment lookup.
    ///
    /// Slave variables win over the respawn variable. Unparseable values
    /// are ignored with a warning.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fd = |key: &str| -> Option<RawFd> {
            let raw = lookup(key)?;
            match raw.trim().parse::<RawFd>() {
                Ok(fd) if fd >= 0 => Some(fd),
                _ => {
                    warn!(var = key, value = %raw, "ignoring invalid file descriptor in environment");
                    None
                }
            }
        };

        if let (Some(initial_state_fd), Some(result_fd)) =
            (fd(SLAVE_INITIAL_STATE_ENV), fd(SLAVE_RESULT_ENV))
        {
            return ProcessRole::Slave {
                initial_state_fd,
                result_fd,
            };
        }
        if let Some(state_fd) = fd(INITIAL_STATE_ENV) {
            return ProcessRole::Respawned { state_fd };
        }
        ProcessRole::Standalone
    }

    pub fn is_slave(&self) -> bool {
        matches!(self, ProcessRole::Slave { .. })
    }
}

static ADOPTED_FDS: Mutex<BTreeSet<RawFd>> = Mutex::new(BTreeSet::new());

/// Take ownership of a descriptor inherited from the parent.
///
/// Each descriptor can be adopted once per process; a second attempt is an
/// error instead of a double close. The descriptor is made close-on-exec so
/// commands run from here do not inherit it.
pub(crate) fn adopt_fd(fd: RawFd) -> Result<OwnedFd> {
    let mut adopted = ADOPTED_FDS
        .lock()
        .map_err(|_| RespawnError::Other(anyhow::anyhow!("fd registry poisoned")))?;
    if adopted.contains(&fd) {
        return Err(RespawnError::Other(anyhow::anyhow!(
            "file descriptor {fd} was already taken over"
        )));
    }
    // Fails with EBADF if the descriptor is not open.
    set_cloexec(fd)?;
    adopted.insert(fd);
    // SAFETY: the descriptor is open (checked above), was handed to us by
    // the parent through the environment, and the registry guarantees a
    // single owner within this process.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
