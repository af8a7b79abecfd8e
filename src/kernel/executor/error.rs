//! Executor error types and status enums.

use thiserror::Error;

use crate::cluster::message::ControlRequest;
use crate::kernel::traits::{CloseReason, ClusterTime, Role, SessionId};

// =============================================================================
// EXECUTOR STATUS
// =============================================================================

/// Terminal status of the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorStatus {
    /// Executor is running normally.
    Running,
    /// Executor has halted after a fatal error.
    /// No further entries will be applied.
    Halted,
}

// =============================================================================
// EFFECTS
// =============================================================================

/// Egress and control work produced by one step.
///
/// The executor NEVER performs these; the node carries them out after the
/// step, and only the leader transmits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// A session was registered. Acknowledge the connect.
    SessionOpened {
        session_id: SessionId,
        correlation_id: u64,
        response_endpoint: String,
    },

    /// A session was closed. Discard its egress.
    SessionClosed { session_id: SessionId, reason: CloseReason },

    /// Deliver a service reply.
    Response {
        session_id: SessionId,
        correlation_id: u64,
        timestamp: ClusterTime,
        payload: Vec<u8>,
    },

    /// Tell the session its message was rejected.
    Rejected {
        session_id: SessionId,
        correlation_id: u64,
        detail: String,
    },

    /// Forward to the log.
    Control(ControlRequest),

    /// A new leadership term started.
    LeadershipChanged {
        leadership_term: u64,
        leader_member_id: u32,
        role: Role,
    },
}

// =============================================================================
// STEP RESULT
// =============================================================================

/// Result of a single step execution.
#[derive(Debug, PartialEq, Eq)]
pub enum StepResult {
    /// Entry was applied successfully.
    Applied { position: u64, effects: Vec<Effect> },

    /// Entry was rejected with a deterministic error.
    /// Service state is unchanged, but the cursor advances.
    Rejected {
        position: u64,
        error: String,
        effects: Vec<Effect>,
    },

    /// Entry at or below the last applied position. Nothing was done.
    Duplicate { position: u64 },
}

impl StepResult {
    pub fn effects(&self) -> &[Effect] {
        match self {
            StepResult::Applied { effects, .. } | StepResult::Rejected { effects, .. } => effects,
            StepResult::Duplicate { .. } => &[],
        }
    }
}

// =============================================================================
// FATAL ERROR
// =============================================================================

/// Fatal errors. Every variant except `SnapshotError` halts the executor.
#[derive(Debug, Error)]
pub enum FatalError {
    /// A service callback panicked.
    #[error("poison pill at position {position}: {message}")]
    PoisonPill { position: u64, message: String },

    /// The executor is already halted.
    #[error("executor is halted")]
    Halted,

    /// The log delivered an entry out of sequence.
    #[error("position gap: expected {expected}, found {found}")]
    PositionGap { expected: u64, found: u64 },

    /// The log or transport under this node failed.
    #[error("substrate fault: {0}")]
    SubstrateFault(String),

    /// Failed to take or record a snapshot.
    #[error("snapshot error: {0}")]
    SnapshotError(String),

    /// A recorded snapshot could not be restored.
    #[error("restore error: {0}")]
    RestoreError(String),
}
