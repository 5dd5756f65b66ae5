// src/watch/mod.rs

//! Change detection.
//!
//! This module is responsible for:
//! - Fingerprinting single files (stat snapshot + content id).
//! - Aggregating them into a [`ProgramId`] with a deterministic id and a
//!   cheap `changed()` predicate.
//! - Tracking files shared between several slaves ([`TrackedFile`]).
//! - Blocking until a program id changes ([`ChangeWatcher`]).
//!
//! Detection is poll-based; nothing here subscribes to filesystem events.

pub mod file_record;
pub mod hash;
pub mod program_id;
pub mod tracked_file;
pub mod watcher;

pub use file_record::{FileCheck, FileRecord, FileStat};
pub use hash::{HashPolicy, DEFAULT_TEXT_EXTENSIONS, normalize_text};
pub use program_id::{ProgramId, default_search_path, resolve_file_path};
pub use tracked_file::TrackedFile;
pub use watcher::{ChangeWatcher, DEFAULT_DEBOUNCE, DEFAULT_POLL_INTERVAL};
