// src/exec/need.rs

use crate::watch::ProgramId;

/// Whether a slave should run on the next scheduling pass.
///
/// `Auto` defers to the slave's own tracked files; the forced states pin
/// the answer when an outside decision (a shared file changed, the
/// scheduler just satisfied the need) overrides them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NeedState {
    #[default]
    ForcedNeeded,
    ForcedNotNeeded,
    Auto,
}

/// Resolve a need state for a slave that is not running.
pub fn resolve_needed(state: NeedState, program_id: &ProgramId) -> bool {
    match state {
        NeedState::ForcedNeeded => true,
        NeedState::ForcedNotNeeded => false,
        NeedState::Auto => program_id.changed(),
    }
}
