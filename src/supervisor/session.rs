// src/supervisor/session.rs

//! Child side of the manager/slave protocol.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use tracing::debug;

use crate::errors::{RespawnError, Result};
use crate::exec::channel::write_payload;
use crate::supervisor::role::{ProcessRole, adopt_fd};
use crate::types::{InitialState, SlaveReport, Subcommand};
use crate::watch::ProgramId;

/// A slave's connection to its manager.
///
/// Opening it reads the initial state the manager sent; [`SlaveSession::report`]
/// writes the result and consumes the session, since a slave reports once.
#[derive(Debug)]
pub struct SlaveSession {
    name: Option<String>,
    program_id: ProgramId,
    result: File,
}

impl SlaveSession {
    /// Fails with [`RespawnError::NotSlave`] unless `role` is a slave role.
    pub fn open(role: &ProcessRole) -> Result<Self> {
        let ProcessRole::Slave {
            initial_state_fd,
            result_fd,
        } = *role
        else {
            return Err(RespawnError::NotSlave);
        };

        let mut initial = File::from(adopt_fd(initial_state_fd)?);
        let result = File::from(adopt_fd(result_fd)?);

        let mut buffer = Vec::new();
        initial.read_to_end(&mut buffer)?;
        let state: InitialState = serde_json::from_slice(&buffer)?;
        debug!(
            name = state.name.as_deref().unwrap_or("-"),
            files = state.program_id.len(),
            "received initial state"
        );

        Ok(Self {
            name: state.name,
            program_id: state.program_id,
            result,
        })
    }

    /// Name the manager gave this slave, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The manager's view of this slave's files at spawn time.
    pub fn program_id(&self) -> &ProgramId {
        &self.program_id
    }

    /// Send the result back to the manager.
    pub fn report(self, subcommands: Vec<Subcommand>, files: Vec<PathBuf>) -> Result<()> {
        debug!(
            subcommands = subcommands.len(),
            files = files.len(),
            "reporting to manager"
        );
        write_payload(self.result, &SlaveReport { subcommands, files })
    }
}
