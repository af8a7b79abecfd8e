//! Node-side client session egress.
//!
//! The executor owns the replicated session registry. This manager owns the
//! node-local half: one publication per session's response endpoint, and a
//! bounded buffer of responses that could not be delivered before their
//! deadline. Failures here are logged and contained; they never reach the
//! apply path.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::backpressure::{BackoffIdleStrategy, BackpressureGate, GateError};
use crate::cluster::message::EgressMessage;
use crate::cluster::substrate::{OfferOutcome, Publication, Transport, TransportError};
use crate::config::NodeConfig;

use super::traits::{ClientSession, Role, SessionId};

/// What happened to one egress message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the session's response endpoint.
    Sent,
    /// Held until the endpoint drains.
    Buffered,
    /// This node is a follower; the leader delivers.
    Skipped,
    /// The session is closed or its endpoint is gone.
    Discarded,
}

struct EgressSession {
    response_endpoint: String,
    publication: Option<Box<dyn Publication + Send>>,
    pending: VecDeque<Vec<u8>>,
}

impl EgressSession {
    fn new(response_endpoint: String) -> Self {
        EgressSession {
            response_endpoint,
            publication: None,
            pending: VecDeque::new(),
        }
    }
}

/// Egress for every open session on this node.
pub struct SessionManager {
    member_id: u32,
    role: Role,
    transport: Arc<dyn Transport>,
    gate: BackpressureGate,
    send_timeout: Duration,
    max_buffered: usize,
    sessions: BTreeMap<SessionId, EgressSession>,
}

impl SessionManager {
    pub fn new(config: &NodeConfig, transport: Arc<dyn Transport>) -> Self {
        SessionManager {
            member_id: config.member_id,
            role: Role::Follower,
            transport,
            gate: BackpressureGate::new(BackoffIdleStrategy::from_config(&config.idle)),
            send_timeout: config.response_send_timeout(),
            max_buffered: config.max_buffered_responses,
            sessions: BTreeMap::new(),
        }
    }

    /// Track a newly opened session.
    pub fn open(&mut self, session_id: SessionId, response_endpoint: &str) {
        self.sessions
            .entry(session_id)
            .or_insert_with(|| EgressSession::new(response_endpoint.to_string()));
    }

    /// Track every open session of a restored registry.
    pub fn restore(&mut self, sessions: &BTreeMap<SessionId, ClientSession>) {
        for session in sessions.values().filter(|s| s.is_open()) {
            self.open(session.id, &session.response_endpoint);
        }
    }

    /// Forget a closed session. Undelivered responses are dropped.
    pub fn close(&mut self, session_id: SessionId) {
        if let Some(session) = self.sessions.remove(&session_id) {
            if !session.pending.is_empty() {
                debug!(
                    member_id = self.member_id,
                    session_id,
                    discarded = session.pending.len(),
                    "discarding undelivered responses of closed session"
                );
            }
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Switch role. Stepping down drops every buffered response; the new
    /// leader owns egress from here on.
    pub fn set_role(&mut self, role: Role) {
        if self.role == Role::Leader && role == Role::Follower {
            for session in self.sessions.values_mut() {
                session.pending.clear();
                session.publication = None;
            }
        }
        self.role = role;
    }

    pub fn is_open(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn open_sessions(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Responses held for `session_id`.
    pub fn buffered(&self, session_id: SessionId) -> usize {
        self.sessions.get(&session_id).map_or(0, |s| s.pending.len())
    }

    /// Deliver `message` to its session through the gate.
    ///
    /// Order within a session is preserved: anything already buffered goes
    /// first, and if it cannot, `message` joins the buffer behind it.
    pub fn deliver(&mut self, message: &EgressMessage) -> Delivery {
        if self.role != Role::Leader {
            return Delivery::Skipped;
        }
        let session_id = message.session_id();
        let member_id = self.member_id;
        let max_buffered = self.max_buffered;
        let deadline = Instant::now() + self.send_timeout;

        let Some(session) = self.sessions.get_mut(&session_id) else {
            debug!(member_id, session_id, "egress for closed session discarded");
            return Delivery::Discarded;
        };

        let bytes = message.serialize();
        if !session.pending.is_empty() {
            drain(member_id, session_id, session, self.transport.as_ref());
            if !session.pending.is_empty() {
                return buffer(member_id, session_id, session, bytes, max_buffered);
            }
        }

        match ensure_connected(self.transport.as_ref(), session) {
            Ok(()) => {}
            Err(TransportError::Closed { .. }) => {
                debug!(member_id, session_id, "response endpoint closed, discarding");
                return Delivery::Discarded;
            }
            Err(e) => {
                warn!(member_id, session_id, error = %e, "response endpoint unreachable");
                return buffer(member_id, session_id, session, bytes, max_buffered);
            }
        }
        let Some(publication) = session.publication.as_mut() else {
            return buffer(member_id, session_id, session, bytes, max_buffered);
        };

        match self.gate.send(publication.as_mut(), &bytes, deadline, || 0) {
            Ok(retries) => {
                trace!(member_id, session_id, retries, "response sent");
                Delivery::Sent
            }
            Err(GateError::SendTimeout { attempts, waited }) => {
                warn!(member_id, session_id, attempts, ?waited, "response send timed out");
                buffer(member_id, session_id, session, bytes, max_buffered)
            }
            Err(GateError::SessionClosed) => {
                debug!(member_id, session_id, "response endpoint closed, discarding");
                session.publication = None;
                session.pending.clear();
                Delivery::Discarded
            }
        }
    }

    /// Deliver `make(session_id)` to every tracked session.
    pub fn broadcast(&mut self, make: impl Fn(SessionId) -> EgressMessage) -> usize {
        let ids = self.open_sessions();
        ids.into_iter()
            .filter(|&id| self.deliver(&make(id)) == Delivery::Sent)
            .count()
    }

    /// Retry buffered responses without blocking. Returns how many went out.
    pub fn flush(&mut self) -> usize {
        if self.role != Role::Leader {
            return 0;
        }
        let member_id = self.member_id;
        let transport = self.transport.as_ref();
        self.sessions
            .iter_mut()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(&id, session)| drain(member_id, id, session, transport))
            .sum()
    }
}

fn ensure_connected(transport: &dyn Transport, session: &mut EgressSession) -> Result<(), TransportError> {
    if session.publication.is_none() {
        session.publication = Some(transport.connect(&session.response_endpoint)?);
    }
    Ok(())
}

/// Offer buffered responses until one is refused.
fn drain(member_id: u32, session_id: SessionId, session: &mut EgressSession, transport: &dyn Transport) -> usize {
    if ensure_connected(transport, session).is_err() {
        return 0;
    }
    let Some(publication) = session.publication.as_mut() else {
        return 0;
    };
    let mut sent = 0;
    while let Some(bytes) = session.pending.front() {
        match publication.offer(bytes) {
            OfferOutcome::Accepted => {
                session.pending.pop_front();
                sent += 1;
            }
            OfferOutcome::BackPressured | OfferOutcome::NotConnected => break,
            OfferOutcome::Closed => {
                debug!(
                    member_id,
                    session_id,
                    discarded = session.pending.len(),
                    "response endpoint closed, discarding buffer"
                );
                session.pending.clear();
                session.publication = None;
                break;
            }
        }
    }
    sent
}

fn buffer(
    member_id: u32,
    session_id: SessionId,
    session: &mut EgressSession,
    bytes: Vec<u8>,
    max_buffered: usize,
) -> Delivery {
    if session.pending.len() >= max_buffered {
        warn!(member_id, session_id, max_buffered, "egress buffer full, dropping response");
        return Delivery::Discarded;
    }
    session.pending.push_back(bytes);
    Delivery::Buffered
}
