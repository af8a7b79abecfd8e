use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

// =============================================================================
// APPLY CONTEXT
// =============================================================================

/// Session identifier, assigned by the log on connect. Never reused.
pub type SessionId = u64;

/// Cluster time.
///
/// Nanoseconds since Unix epoch, as assigned by the ordered log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterTime(pub u64);

impl ClusterTime {
    pub fn from_nanos(nanos: u64) -> Self {
        ClusterTime(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// This time plus `millis` milliseconds, saturating.
    pub fn plus_millis(&self, millis: u64) -> Self {
        ClusterTime(self.0.saturating_add(millis.saturating_mul(1_000_000)))
    }
}

/// Context passed to every state-changing service callback.
///
/// All values are derived from the log entry being applied, so replay
/// produces identical results on every node.
#[derive(Clone, Debug)]
pub struct ApplyContext {
    /// Timestamp of the entry. NOT the wall clock.
    timestamp: ClusterTime,

    /// Log position of the entry.
    position: u64,

    /// Leadership term the entry was applied in.
    leadership_term: u64,

    /// BLAKE3(leadership_term || position).
    random_seed: [u8; 32],
}

impl ApplyContext {
    pub fn new(timestamp: ClusterTime, position: u64, leadership_term: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&leadership_term.to_le_bytes());
        hasher.update(&position.to_le_bytes());
        ApplyContext {
            timestamp,
            position,
            leadership_term,
            random_seed: *hasher.finalize().as_bytes(),
        }
    }

    /// Replicated time of this entry.
    #[inline]
    pub fn timestamp(&self) -> ClusterTime {
        self.timestamp
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[inline]
    pub fn leadership_term(&self) -> u64 {
        self.leadership_term
    }

    /// Deterministic seed for this entry. Use it to seed a PRNG if randomness
    /// is needed.
    #[inline]
    pub fn random_seed(&self) -> [u8; 32] {
        self.random_seed
    }
}

// =============================================================================
// SESSIONS
// =============================================================================

/// Why a session was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// The client asked to close.
    ClientAction,
    /// No ingress or keep-alive within the session timeout.
    Timeout,
    /// The service asked to close.
    ServiceAction,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::ClientAction => "CLIENT_ACTION",
            CloseReason::Timeout => "TIMEOUT",
            CloseReason::ServiceAction => "SERVICE_ACTION",
        };
        f.write_str(name)
    }
}

/// Session lifecycle: `Open --close(reason)--> Closed`. Closed is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Closed(CloseReason),
}

/// A client session as seen by the replicated state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub id: SessionId,
    /// Where egress for this session is sent.
    pub response_endpoint: String,
    /// Cluster time of the open entry.
    pub opened_at: ClusterTime,
    pub state: SessionState,
}

impl ClientSession {
    pub fn new(id: SessionId, response_endpoint: String, opened_at: ClusterTime) -> Self {
        ClientSession {
            id,
            response_endpoint,
            opened_at,
            state: SessionState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Transition to `Closed`. Returns false if already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.is_open() {
            self.state = SessionState::Closed(reason);
            true
        } else {
            false
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.state {
            SessionState::Open => None,
            SessionState::Closed(reason) => Some(reason),
        }
    }
}

/// A committed application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionMessage {
    pub session_id: SessionId,
    /// Client-assigned; echoed on the response.
    pub correlation_id: u64,
    pub timestamp: ClusterTime,
    pub payload: Vec<u8>,
}

/// This node's role in the current leadership term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => f.write_str("follower"),
            Role::Leader => f.write_str("leader"),
        }
    }
}

// =============================================================================
// SERVICE ACTIONS
// =============================================================================

/// Output of a service callback.
///
/// The service CANNOT perform I/O directly. It emits actions that the node
/// carries out after the step, on the leader only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceAction {
    /// Reply to the session the current entry belongs to.
    Reply(Vec<u8>),

    /// Send to any open session.
    Send { session_id: SessionId, payload: Vec<u8> },

    /// Ask the log to deliver a timer event once cluster time reaches `deadline`.
    ScheduleTimer { correlation_id: u64, deadline: ClusterTime },

    CancelTimer { correlation_id: u64 },

    /// Ask the log to close a session with reason `ServiceAction`.
    CloseSession { session_id: SessionId },
}

/// Next state plus the actions to carry out.
pub type Transition<S> = (S, Vec<ServiceAction>);

// =============================================================================
// SNAPSHOT
// =============================================================================

/// A byte stream for snapshot serialization/deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotStream {
    /// Schema version of the service's state encoding.
    pub schema_version: u32,
    /// The serialized state bytes.
    pub data: Vec<u8>,
}

// =============================================================================
// CLUSTERED SERVICE TRAIT
// =============================================================================

/// The contract for a deterministic service hosted by a cluster node.
///
/// One method per event delivered by the log. None has a default body.
///
/// # Laws
///
/// 1. State-changing callbacks MUST be deterministic: same (state, input, ctx)
///    gives the same (state', actions).
/// 2. Callbacks run one at a time, in log order.
/// 3. `snapshot()` MUST capture complete state: restore(snapshot(state)) ≡ state.
/// 4. `restore()` is only called before any entry is applied.
/// 5. No I/O, no wall clock, no unseeded randomness. Use `ctx`.
///
/// A panic in any callback halts the node.
pub trait ClusteredService: Send + 'static {
    /// The service's replicated state.
    type State: Clone + Send;

    /// Deterministic rejection. The entry is skipped, state is unchanged.
    type Error: Error + Send + Sync + 'static;

    /// Initial state of a fresh cluster.
    fn genesis(&self) -> Self::State;

    /// Called once before the first entry, after genesis or restore.
    /// `snapshot_position` is the position the state was restored at.
    fn on_start(&self, state: &Self::State, snapshot_position: Option<u64>);

    fn on_session_open(
        &self,
        state: &Self::State,
        session: &ClientSession,
        ctx: &ApplyContext,
    ) -> Result<Transition<Self::State>, Self::Error>;

    /// Apply one committed message. Only called for open sessions.
    fn on_session_message(
        &self,
        state: &Self::State,
        message: SessionMessage,
        ctx: &ApplyContext,
    ) -> Result<Transition<Self::State>, Self::Error>;

    fn on_session_close(
        &self,
        state: &Self::State,
        session: &ClientSession,
        reason: CloseReason,
        ctx: &ApplyContext,
    ) -> Result<Transition<Self::State>, Self::Error>;

    fn on_timer_event(
        &self,
        state: &Self::State,
        correlation_id: u64,
        ctx: &ApplyContext,
    ) -> Result<Transition<Self::State>, Self::Error>;

    /// This node gained or lost leadership. Cannot change replicated state.
    fn on_role_change(&self, role: Role);

    /// Serialize the entire state for snapshot storage.
    fn snapshot(&self, state: &Self::State) -> SnapshotStream;

    /// Rebuild state from a snapshot.
    fn restore(&self, stream: SnapshotStream) -> Result<Self::State, Self::Error>;

    /// The node is halting. Cannot change replicated state.
    fn on_terminate(&self, state: &Self::State);
}
