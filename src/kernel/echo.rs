//! Echo service: replies to every message with its payload, unchanged.
//!
//! Payloads are checked against the configured [`PayloadKind`] before they
//! are echoed, so a malformed payload is rejected instead of applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::codec::{CodecError, PayloadKind};
use crate::config::NodeConfig;

use super::traits::{
    ApplyContext, ClientSession, CloseReason, ClusteredService, Role, ServiceAction, SessionId, SessionMessage,
    SnapshotStream, Transition,
};

/// Schema version of [`EchoState`] snapshots.
pub const ECHO_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum EchoError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] CodecError),

    #[error("unsupported snapshot schema version {0}")]
    UnsupportedSchema(u32),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
}

/// Replicated echo state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoState {
    /// Messages echoed since genesis.
    pub echoed: u64,
    /// Messages echoed per open session.
    pub per_session: BTreeMap<SessionId, u64>,
    /// Timestamp of the last echoed message, in cluster nanoseconds.
    pub last_timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct EchoService {
    kind: PayloadKind,
}

impl EchoService {
    pub fn new(kind: PayloadKind) -> Self {
        EchoService { kind }
    }

    /// The echo service a node is configured to run.
    pub fn from_config(config: &NodeConfig) -> Self {
        EchoService::new(config.payload_kind)
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }
}

impl ClusteredService for EchoService {
    type State = EchoState;
    type Error = EchoError;

    fn genesis(&self) -> EchoState {
        EchoState::default()
    }

    fn on_start(&self, state: &EchoState, snapshot_position: Option<u64>) {
        info!(kind = ?self.kind, echoed = state.echoed, ?snapshot_position, "echo service started");
    }

    fn on_session_open(
        &self,
        state: &EchoState,
        session: &ClientSession,
        _ctx: &ApplyContext,
    ) -> Result<Transition<EchoState>, EchoError> {
        let mut next = state.clone();
        next.per_session.insert(session.id, 0);
        Ok((next, Vec::new()))
    }

    fn on_session_message(
        &self,
        state: &EchoState,
        message: SessionMessage,
        ctx: &ApplyContext,
    ) -> Result<Transition<EchoState>, EchoError> {
        self.kind.validate(&message.payload)?;

        let mut next = state.clone();
        next.echoed += 1;
        *next.per_session.entry(message.session_id).or_insert(0) += 1;
        next.last_timestamp = ctx.timestamp().as_nanos();

        Ok((next, vec![ServiceAction::Reply(message.payload)]))
    }

    fn on_session_close(
        &self,
        state: &EchoState,
        session: &ClientSession,
        _reason: CloseReason,
        _ctx: &ApplyContext,
    ) -> Result<Transition<EchoState>, EchoError> {
        let mut next = state.clone();
        next.per_session.remove(&session.id);
        Ok((next, Vec::new()))
    }

    fn on_timer_event(
        &self,
        state: &EchoState,
        _correlation_id: u64,
        _ctx: &ApplyContext,
    ) -> Result<Transition<EchoState>, EchoError> {
        Ok((state.clone(), Vec::new()))
    }

    fn on_role_change(&self, role: Role) {
        info!(%role, "echo service role changed");
    }

    fn snapshot(&self, state: &EchoState) -> SnapshotStream {
        SnapshotStream {
            schema_version: ECHO_SCHEMA_VERSION,
            data: bincode::serialize(state).expect("EchoState serialization should not fail"),
        }
    }

    fn restore(&self, stream: SnapshotStream) -> Result<EchoState, EchoError> {
        if stream.schema_version != ECHO_SCHEMA_VERSION {
            return Err(EchoError::UnsupportedSchema(stream.schema_version));
        }
        bincode::deserialize(&stream.data).map_err(|e| EchoError::CorruptSnapshot(e.to_string()))
    }

    fn on_terminate(&self, state: &EchoState) {
        info!(echoed = state.echoed, "echo service terminating");
    }
}
