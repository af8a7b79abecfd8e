use serde::{Deserialize, Serialize};

use crate::kernel::traits::{CloseReason, SessionId};

/// Messages a client sends to a member's client endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngressMessage {
    /// Ask the cluster to open a session whose egress goes to `response_endpoint`.
    Connect {
        correlation_id: u64,
        response_endpoint: String,
    },

    /// Application payload for an open session.
    SessionMessage {
        session_id: SessionId,
        correlation_id: u64,
        payload: Vec<u8>,
    },

    /// Liveness signal. Never enters the log.
    KeepAlive { session_id: SessionId },

    /// Client-initiated close.
    Close { session_id: SessionId },
}

/// Outcome carried by a [`EgressMessage::SessionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCode {
    /// Session opened.
    Ok,
    /// The request referenced by the correlation id was rejected.
    Error,
    /// This member is not the leader; reconnect to `leader_member_id`.
    Redirect,
    /// The session has been closed.
    Closed,
}

/// Messages the cluster sends to a session's response endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EgressMessage {
    SessionEvent {
        session_id: SessionId,
        correlation_id: u64,
        leadership_term: u64,
        leader_member_id: u32,
        code: EventCode,
        /// Human-readable detail; empty for `Ok`.
        detail: String,
    },

    /// Reply produced by the service for one applied message.
    Response {
        session_id: SessionId,
        correlation_id: u64,
        /// Cluster time of the log entry that produced the reply.
        timestamp: u64,
        payload: Vec<u8>,
    },

    /// Leadership moved; egress now comes from `leader_member_id`.
    NewLeader {
        session_id: SessionId,
        leadership_term: u64,
        leader_member_id: u32,
    },
}

/// One committed entry of the ordered log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log position, starting at 1 and contiguous.
    pub position: u64,
    /// Cluster time in nanoseconds since the Unix epoch. Strictly increasing.
    pub timestamp: u64,
    pub body: LogBody,
}

/// Entry kinds the sequencer commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogBody {
    NewLeadershipTerm {
        term: u64,
        leader_member_id: u32,
    },
    SessionOpen {
        session_id: SessionId,
        correlation_id: u64,
        response_endpoint: String,
    },
    SessionMessage {
        session_id: SessionId,
        correlation_id: u64,
        payload: Vec<u8>,
    },
    SessionClose {
        session_id: SessionId,
        reason: CloseReason,
    },
    /// A scheduled timer fired.
    Timer { correlation_id: u64 },
}

/// Requests a leader's service sends back to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Commit a `Timer` entry once cluster time reaches `deadline`.
    ScheduleTimer { correlation_id: u64, deadline: u64 },
    CancelTimer { correlation_id: u64 },
    /// Commit a `SessionClose` with reason `ServiceAction`.
    CloseSession { session_id: SessionId },
}

impl IngressMessage {
    /// Serialize message to bytes using bincode.
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("IngressMessage serialization should not fail")
    }

    /// Deserialize message from bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Session the message belongs to, if it has one yet.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            IngressMessage::Connect { .. } => None,
            IngressMessage::SessionMessage { session_id, .. }
            | IngressMessage::KeepAlive { session_id }
            | IngressMessage::Close { session_id } => Some(*session_id),
        }
    }
}

impl EgressMessage {
    /// Serialize message to bytes using bincode.
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("EgressMessage serialization should not fail")
    }

    /// Deserialize message from bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            EgressMessage::SessionEvent { session_id, .. }
            | EgressMessage::Response { session_id, .. }
            | EgressMessage::NewLeader { session_id, .. } => *session_id,
        }
    }
}

impl LogBody {
    /// Session the entry applies to, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            LogBody::SessionOpen { session_id, .. }
            | LogBody::SessionMessage { session_id, .. }
            | LogBody::SessionClose { session_id, .. } => Some(*session_id),
            LogBody::NewLeadershipTerm { .. } | LogBody::Timer { .. } => None,
        }
    }
}
