// src/exec/mod.rs

//! Process execution layer.
//!
//! - [`slave`] owns one child process: launching it with its IPC channels,
//!   reaping it, and turning its report into tracked-file state.
//! - [`need`] holds the tri-state "should this run again" flag.
//! - [`channel`] has the pipe plumbing and the payload codec shared with
//!   the child side in [`crate::supervisor`].

pub mod channel;
pub mod need;
pub mod slave;

pub use channel::{INITIAL_STATE_ENV, SLAVE_INITIAL_STATE_ENV, SLAVE_RESULT_ENV};
pub use need::{NeedState, resolve_needed};
pub use slave::{Slave, SlaveId, SlaveState};
