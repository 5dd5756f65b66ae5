// src/engine/mod.rs

//! Orchestration engine for respawn.
//!
//! [`manager`] owns the worker pool and the polling loop:
//! - reap finished slaves and absorb their reports,
//! - re-trigger slaves whose shared tracked files changed,
//! - spawn the next candidates up to the parallel level.
//!
//! [`hooks`] holds the lifecycle callbacks the manager fires along the way.

pub mod hooks;
pub mod manager;

pub use hooks::{Hooks, SlaveCallback};
pub use manager::{DEFAULT_MANAGER_POLL_INTERVAL, Manager, PollOutcome};
