//! Guarded batch state machine.
//!
//! ```text
//! Created -> Queued -> Running <-> Paused -> {Completed | Cancelled | Failed}
//!              ^                                  |           |
//!              `------------- retry --------------+-----------'
//! ```
//! `Cancelled` is final; `Completed` and `Failed` may be re-queued by a retry.

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::BatchState;

/// Request to move a batch between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    /// Accept a created batch into the queue.
    Enqueue,
    /// Begin dispatching.
    Start,
    /// Suspend dispatch.
    Pause,
    /// Continue dispatch.
    Resume,
    /// Stop permanently.
    Cancel,
    /// Every item reached a terminal status.
    Complete,
    /// Halt after an item or orchestrator failure.
    Fail,
    /// Re-queue after failed items were reset.
    Retry,
}

impl BatchEvent {
    /// Verb used in error messages.
    #[must_use]
    pub const fn action(self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Retry => "retry",
        }
    }
}

/// Returns the state reached by applying `event` in `from`.
///
/// # Errors
///
/// Returns `ForgeError::InvalidTransition` for any pair not in the table.
pub fn transition(from: BatchState, event: BatchEvent) -> Result<BatchState> {
    use BatchEvent as E;
    use BatchState as S;

    let next = match (from, event) {
        (S::Created, E::Enqueue) | (S::Completed | S::Failed, E::Retry) => S::Queued,
        (S::Queued, E::Start) | (S::Paused, E::Resume) => S::Running,
        (S::Running, E::Pause) => S::Paused,
        (S::Running | S::Paused, E::Cancel) => S::Cancelled,
        (S::Running, E::Complete) => S::Completed,
        (S::Running | S::Paused, E::Fail) => S::Failed,
        _ => {
            return Err(ForgeError::InvalidTransition {
                entity: "batch",
                from: from.to_string(),
                action: event.action(),
            });
        }
    };
    Ok(next)
}
