// src/supervisor/mod.rs

//! Process-level side of respawn.
//!
//! - [`role`] tells a freshly started process whether it was started by
//!   hand, re-executed by itself, or spawned as a slave.
//! - [`respawn`] is the standalone run/wait/re-exec driver.
//! - [`session`] is the slave end of the manager protocol.

pub mod respawn;
pub mod role;
pub mod session;

pub use respawn::{Loader, Respawn, WorkContext};
pub use role::ProcessRole;
pub use session::SlaveSession;
