//! Cluster client facade.
//!
//! Provides:
//! - Session establishment with leader discovery (redirects are followed)
//! - Gated submission of payloads, with egress polled while waiting
//! - Exactly-once, receipt-order delivery of responses to a listener
//! - An explicit wait for the response to one correlation id

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::backpressure::{BackoffIdleStrategy, BackpressureGate, GateError};
use crate::codec::{AsciiText, CodecError, Payload};
use crate::config::{ClientConfig, ConfigError};
use crate::kernel::traits::SessionId;

use super::membership::{parse_ingress_endpoints, MembershipError};
use super::message::{EgressMessage, EventCode, IngressMessage};
use super::substrate::{Publication, Subscription, Transport, TransportError};

/// Egress buffers read per poll.
const EGRESS_POLL_LIMIT: usize = 64;

/// Correlation id of the connect request.
const CONNECT_CORRELATION_ID: u64 = 1;

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("session {session_id} is closed")]
    SessionClosed { session_id: SessionId },

    #[error("no session established before the connect deadline")]
    ConnectTimeout,

    #[error("connect rejected: {0}")]
    ConnectRejected(String),

    #[error("no response to correlation id {correlation_id} before the deadline")]
    ResponseTimeout { correlation_id: u64 },

    #[error("correlation id {correlation_id} rejected: {detail}")]
    Rejected { correlation_id: u64, detail: String },

    #[error("member {0} is not in the ingress endpoint list")]
    UnknownMember(u32),
}

/// Receives everything the cluster sends to this client's session.
pub trait EgressListener: Send {
    /// A service response. Called once per response, in receipt order.
    fn on_message(&mut self, session_id: SessionId, timestamp: u64, correlation_id: u64, payload: &[u8]);

    /// A session event: rejection, close, or connect acknowledgement.
    fn on_session_event(&mut self, _correlation_id: u64, _code: EventCode, _detail: &str) {}

    /// Leadership moved; ingress has been switched.
    fn on_new_leader(&mut self, _leadership_term: u64, _leader_member_id: u32) {}
}

/// A response handed to a [`ChannelListener`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedResponse {
    pub session_id: SessionId,
    pub correlation_id: u64,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

/// Listener that forwards responses to a channel.
pub struct ChannelListener {
    tx: Sender<ReceivedResponse>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<ReceivedResponse>) {
        let (tx, rx) = unbounded();
        (ChannelListener { tx }, rx)
    }
}

impl EgressListener for ChannelListener {
    fn on_message(&mut self, session_id: SessionId, timestamp: u64, correlation_id: u64, payload: &[u8]) {
        let _ = self.tx.send(ReceivedResponse {
            session_id,
            correlation_id,
            timestamp,
            payload: payload.to_vec(),
        });
    }
}

/// A submitted message awaiting its response. The payload is kept so a
/// message redirected by a follower can be resubmitted to the leader.
struct Outstanding {
    submitted: Instant,
    payload: Vec<u8>,
}

/// A connected client session.
pub struct ClusterClient<L: EgressListener> {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    /// Member id -> client endpoint.
    members: BTreeMap<u32, String>,
    session_id: SessionId,
    leadership_term: u64,
    leader_member_id: u32,
    ingress: Box<dyn Publication + Send>,
    egress: Box<dyn Subscription + Send>,
    gate: BackpressureGate,
    /// Egress read while the gate idled, not yet dispatched.
    inbound: VecDeque<Vec<u8>>,
    listener: L,
    next_correlation_id: u64,
    /// Submitted, unanswered messages by correlation id.
    outstanding: BTreeMap<u64, Outstanding>,
    rejected: BTreeMap<u64, String>,
    last_sent: Instant,
    closed: bool,
}

impl<L: EgressListener> ClusterClient<L> {
    /// Open a session with the cluster.
    ///
    /// Members are tried in id order; a redirect moves straight to the
    /// leader it names. Fails with `ConnectTimeout` if no member opened a
    /// session within the connect timeout.
    pub fn connect(config: ClientConfig, transport: Arc<dyn Transport>, listener: L) -> Result<Self, ClientError> {
        config.validate()?;
        let members = parse_ingress_endpoints(&config.ingress_endpoints)?;
        let mut egress = transport.bind(&config.egress_endpoint, config.egress_capacity)?;
        let response_endpoint = egress.endpoint().to_string();
        let mut gate = BackpressureGate::new(BackoffIdleStrategy::from_config(&config.idle));
        let deadline = Instant::now() + config.connect_timeout();

        let mut member_id = *members.keys().next().ok_or(MembershipError::Empty)?;
        let mut inbound = VecDeque::new();
        let connect = IngressMessage::Connect {
            correlation_id: CONNECT_CORRELATION_ID,
            response_endpoint,
        }
        .serialize();

        loop {
            if Instant::now() >= deadline {
                return Err(ClientError::ConnectTimeout);
            }
            let endpoint = members.get(&member_id).ok_or(ClientError::UnknownMember(member_id))?;
            let mut ingress = match transport.connect(endpoint) {
                Ok(publication) => publication,
                Err(e) => {
                    debug!(member_id, error = %e, "member unreachable");
                    member_id = next_member(&members, member_id);
                    gate.idle(0);
                    continue;
                }
            };

            match gate.send(ingress.as_mut(), &connect, deadline, || 0) {
                Ok(_) => {}
                Err(GateError::SessionClosed) => {
                    member_id = next_member(&members, member_id);
                    continue;
                }
                Err(GateError::SendTimeout { .. }) => return Err(ClientError::ConnectTimeout),
            }

            let Some(event) = await_session_event(egress.as_mut(), &mut gate, &mut inbound, deadline) else {
                return Err(ClientError::ConnectTimeout);
            };
            match event {
                EgressMessage::SessionEvent {
                    session_id,
                    leadership_term,
                    leader_member_id,
                    code: EventCode::Ok,
                    ..
                } => {
                    info!(session_id, leader_member_id, leadership_term, "session established");
                    let now = Instant::now();
                    return Ok(ClusterClient {
                        config,
                        transport,
                        members,
                        session_id,
                        leadership_term,
                        leader_member_id,
                        ingress,
                        egress,
                        gate,
                        inbound,
                        listener,
                        next_correlation_id: CONNECT_CORRELATION_ID + 1,
                        outstanding: BTreeMap::new(),
                        rejected: BTreeMap::new(),
                        last_sent: now,
                        closed: false,
                    });
                }
                EgressMessage::SessionEvent {
                    code: EventCode::Redirect,
                    leader_member_id,
                    ..
                } => {
                    debug!(from = member_id, to = leader_member_id, "redirected to leader");
                    member_id = leader_member_id;
                }
                EgressMessage::SessionEvent { detail, .. } => return Err(ClientError::ConnectRejected(detail)),
                other => trace!(?other, "ignoring egress before session is open"),
            }
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn leader_member_id(&self) -> u32 {
        self.leader_member_id
    }

    pub fn leadership_term(&self) -> u64 {
        self.leadership_term
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    /// Number of submitted messages still awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// The oldest outstanding correlation id whose response is overdue at `now`.
    pub fn overdue(&self, now: Instant) -> Option<u64> {
        let timeout = self.config.response_timeout();
        self.outstanding
            .iter()
            .find(|(_, pending)| now.duration_since(pending.submitted) > timeout)
            .map(|(&id, _)| id)
    }

    /// Take the oldest rejection not yet claimed by [`Self::await_response`].
    pub fn take_rejection(&mut self) -> Option<(u64, String)> {
        self.rejected.pop_first()
    }

    /// Submit `payload` through the gate. Returns its correlation id.
    ///
    /// Egress keeps being polled while the ingress is backpressured.
    pub fn submit(&mut self, payload: &[u8]) -> Result<u64, ClientError> {
        let correlation_id = self.next_correlation_id;
        let message = IngressMessage::SessionMessage {
            session_id: self.session_id,
            correlation_id,
            payload: payload.to_vec(),
        };
        self.offer(&message)?;
        self.next_correlation_id += 1;
        self.outstanding.insert(
            correlation_id,
            Outstanding {
                submitted: Instant::now(),
                payload: payload.to_vec(),
            },
        );
        trace!(session_id = self.session_id, correlation_id, "submitted");
        Ok(correlation_id)
    }

    /// Submit ASCII `text`.
    pub fn submit_text(&mut self, text: &str) -> Result<u64, ClientError> {
        let payload = AsciiText::new(text)?.encode();
        self.submit(&payload)
    }

    pub fn submit_integer(&mut self, value: i64) -> Result<u64, ClientError> {
        self.submit(&value.encode())
    }

    /// Tell the cluster this session is alive.
    pub fn keep_alive(&mut self) -> Result<(), ClientError> {
        let message = IngressMessage::KeepAlive {
            session_id: self.session_id,
        };
        self.offer(&message)
    }

    /// Send a keep-alive if nothing was sent for a keep-alive interval.
    pub fn keep_alive_if_due(&mut self, now: Instant) -> Result<bool, ClientError> {
        if now.duration_since(self.last_sent) < self.config.keep_alive_interval() {
            return Ok(false);
        }
        self.keep_alive()?;
        Ok(true)
    }

    /// Close the session. Outstanding responses are abandoned.
    pub fn close(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Ok(());
        }
        let message = IngressMessage::Close {
            session_id: self.session_id,
        };
        let result = self.offer(&message);
        self.closed = true;
        self.outstanding.clear();
        info!(session_id = self.session_id, "session closed by client");
        result
    }

    /// Dispatch everything received so far. Never blocks; returns the number of
    /// egress messages handled.
    pub fn poll_responses(&mut self) -> usize {
        let Self { egress, inbound, .. } = self;
        poll_into(egress.as_mut(), inbound);

        let mut handled = 0;
        while let Some(bytes) = self.inbound.pop_front() {
            match EgressMessage::deserialize(&bytes) {
                Ok(message) => self.dispatch(message),
                Err(e) => warn!(session_id = self.session_id, error = %e, "malformed egress dropped"),
            }
            handled += 1;
        }
        handled
    }

    /// Poll until the response to `correlation_id` arrives.
    ///
    /// Keep-alives are sent while waiting, so a long wait does not time the
    /// session out.
    pub fn await_response(&mut self, correlation_id: u64, timeout: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let work = self.poll_responses();
            if let Some(detail) = self.rejected.remove(&correlation_id) {
                return Err(ClientError::Rejected { correlation_id, detail });
            }
            if !self.outstanding.contains_key(&correlation_id) {
                return Ok(());
            }
            if self.closed {
                return Err(ClientError::SessionClosed {
                    session_id: self.session_id,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::ResponseTimeout { correlation_id });
            }
            self.keep_alive_if_due(now)?;
            self.gate.idle(work);
        }
    }

    /// Idle once through the client's strategy.
    pub fn idle(&mut self, work_count: usize) {
        self.gate.idle(work_count);
    }

    fn offer(&mut self, message: &IngressMessage) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::SessionClosed {
                session_id: self.session_id,
            });
        }
        let bytes = message.serialize();
        let deadline = Instant::now() + self.config.send_timeout();
        let Self {
            gate,
            ingress,
            egress,
            inbound,
            ..
        } = self;
        gate.send(ingress.as_mut(), &bytes, deadline, || poll_into(egress.as_mut(), inbound))?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn dispatch(&mut self, message: EgressMessage) {
        if message.session_id() != self.session_id {
            trace!(session_id = message.session_id(), "egress for another session ignored");
            return;
        }
        match message {
            EgressMessage::Response {
                session_id,
                correlation_id,
                timestamp,
                payload,
            } => {
                // Correlation 0 is service-initiated and never outstanding.
                if correlation_id != 0 && self.outstanding.remove(&correlation_id).is_none() {
                    debug!(session_id, correlation_id, "duplicate response ignored");
                    return;
                }
                self.listener.on_message(session_id, timestamp, correlation_id, &payload);
            }
            EgressMessage::SessionEvent {
                correlation_id,
                leadership_term,
                leader_member_id,
                code,
                detail,
                ..
            } => {
                match code {
                    EventCode::Error => {
                        warn!(session_id = self.session_id, correlation_id, %detail, "message rejected");
                        self.fail(correlation_id, detail.clone());
                    }
                    EventCode::Closed => {
                        info!(session_id = self.session_id, reason = %detail, "session closed by cluster");
                        self.closed = true;
                    }
                    EventCode::Redirect => self.resubmit(correlation_id, leadership_term, leader_member_id),
                    EventCode::Ok => {}
                }
                self.listener.on_session_event(correlation_id, code, &detail);
            }
            EgressMessage::NewLeader {
                leadership_term,
                leader_member_id,
                ..
            } => self.follow_leader(leadership_term, leader_member_id),
        }
    }

    /// A follower dropped `correlation_id`. Follow the leader it named and
    /// send the message again, or fail it if the leader cannot be reached.
    fn resubmit(&mut self, correlation_id: u64, leadership_term: u64, leader_member_id: u32) {
        self.follow_leader(leadership_term, leader_member_id);
        let Some(payload) = self.outstanding.get(&correlation_id).map(|p| p.payload.clone()) else {
            return;
        };
        if self.leadership_term < leadership_term {
            self.fail(correlation_id, format!("leader {} is unreachable", leader_member_id));
            return;
        }

        let message = IngressMessage::SessionMessage {
            session_id: self.session_id,
            correlation_id,
            payload,
        };
        match self.offer(&message) {
            Ok(()) => debug!(
                session_id = self.session_id,
                correlation_id,
                leader_member_id = self.leader_member_id,
                "redirected message resubmitted"
            ),
            Err(e) => self.fail(correlation_id, e.to_string()),
        }
    }

    fn fail(&mut self, correlation_id: u64, detail: String) {
        self.outstanding.remove(&correlation_id);
        self.rejected.insert(correlation_id, detail);
    }

    fn follow_leader(&mut self, leadership_term: u64, leader_member_id: u32) {
        if leadership_term < self.leadership_term
            || (leadership_term == self.leadership_term && leader_member_id == self.leader_member_id)
        {
            return;
        }
        if self.switch_ingress(leadership_term, leader_member_id) {
            self.listener.on_new_leader(leadership_term, leader_member_id);
        }
    }

    fn switch_ingress(&mut self, leadership_term: u64, leader_member_id: u32) -> bool {
        let Some(endpoint) = self.members.get(&leader_member_id) else {
            warn!(leader_member_id, "new leader is not in the ingress endpoint list");
            return false;
        };
        match self.transport.connect(endpoint) {
            Ok(publication) => {
                info!(
                    session_id = self.session_id,
                    leadership_term,
                    leader_member_id,
                    "ingress switched to new leader"
                );
                self.ingress = publication;
                self.leadership_term = leadership_term;
                self.leader_member_id = leader_member_id;
                true
            }
            Err(e) => {
                warn!(leader_member_id, error = %e, "cannot reach new leader");
                false
            }
        }
    }
}

impl<L: EgressListener> Drop for ClusterClient<L> {
    fn drop(&mut self) {
        if !self.closed {
            // Single offer; the session times out if it is refused.
            let message = IngressMessage::Close {
                session_id: self.session_id,
            };
            let _ = self.ingress.offer(&message.serialize());
        }
    }
}

fn poll_into(egress: &mut (dyn Subscription + Send), inbound: &mut VecDeque<Vec<u8>>) -> usize {
    egress.poll(&mut |bytes| inbound.push_back(bytes.to_vec()), EGRESS_POLL_LIMIT)
}

fn next_member(members: &BTreeMap<u32, String>, current: u32) -> u32 {
    current
        .checked_add(1)
        .and_then(|next| members.range(next..).next())
        .or_else(|| members.iter().next())
        .map(|(&id, _)| id)
        .unwrap_or(current)
}

/// Wait for the answer to a connect request.
///
/// Egress that arrives after the answer in the same batch is kept in
/// `inbound` for the session to dispatch.
fn await_session_event(
    egress: &mut (dyn Subscription + Send),
    gate: &mut BackpressureGate,
    inbound: &mut VecDeque<Vec<u8>>,
    deadline: Instant,
) -> Option<EgressMessage> {
    loop {
        let mut found = None;
        let work = egress.poll(
            &mut |bytes| {
                if found.is_some() {
                    inbound.push_back(bytes.to_vec());
                    return;
                }
                match EgressMessage::deserialize(bytes) {
                    Ok(
                        event @ EgressMessage::SessionEvent {
                            correlation_id: CONNECT_CORRELATION_ID,
                            ..
                        },
                    ) => found = Some(event),
                    Ok(other) => trace!(?other, "ignoring egress while connecting"),
                    Err(e) => warn!(error = %e, "malformed egress dropped"),
                }
            },
            EGRESS_POLL_LIMIT,
        );
        if found.is_some() {
            return found;
        }
        if Instant::now() >= deadline {
            return None;
        }
        gate.idle(work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::network::InMemoryNetwork;
    use std::thread;

    /// Minimal leader: opens session 7 on connect, echoes messages, and
    /// rejects the payload `[0xFF]`. Hands its endpoint back when done so it
    /// stays bound.
    fn fake_leader(
        network: InMemoryNetwork,
        endpoint: &'static str,
        messages: usize,
    ) -> thread::JoinHandle<Box<dyn Subscription + Send>> {
        let mut ingress = network.bind(endpoint, 64).unwrap();
        thread::spawn(move || {
            let mut egress: Option<Box<dyn Publication + Send>> = None;
            let mut handled = 0;
            let deadline = Instant::now() + Duration::from_secs(5);
            while handled < messages + 1 && Instant::now() < deadline {
                let mut received = Vec::new();
                ingress.poll(&mut |b| received.push(IngressMessage::deserialize(b).unwrap()), 16);
                for message in received {
                    let reply = match message {
                        IngressMessage::Connect {
                            correlation_id,
                            response_endpoint,
                        } => {
                            egress = Some(network.connect(&response_endpoint).unwrap());
                            EgressMessage::SessionEvent {
                                session_id: 7,
                                correlation_id,
                                leadership_term: 1,
                                leader_member_id: 0,
                                code: EventCode::Ok,
                                detail: String::new(),
                            }
                        }
                        IngressMessage::SessionMessage {
                            session_id,
                            correlation_id,
                            payload,
                        } if payload == [0xFF] => EgressMessage::SessionEvent {
                            session_id,
                            correlation_id,
                            leadership_term: 1,
                            leader_member_id: 0,
                            code: EventCode::Error,
                            detail: "bad payload".to_string(),
                        },
                        IngressMessage::SessionMessage {
                            session_id,
                            correlation_id,
                            payload,
                        } => EgressMessage::Response {
                            session_id,
                            correlation_id,
                            timestamp: 0,
                            payload,
                        },
                        _ => continue,
                    };
                    handled += 1;
                    if let Some(egress) = egress.as_mut() {
                        egress.offer(&reply.serialize());
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
            ingress
        })
    }

    fn config(ingress: &str) -> ClientConfig {
        ClientConfig {
            ingress_endpoints: ingress.to_string(),
            connect_timeout_ms: 2_000,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_submit_and_await_response() {
        let network = InMemoryNetwork::new();
        let leader = fake_leader(network.clone(), "localhost:9002", 2);
        let (listener, responses) = ChannelListener::new();

        let mut client = ClusterClient::connect(config("0=localhost:9002"), Arc::new(network), listener).unwrap();
        assert_eq!(client.session_id(), 7);

        let first = client.submit_text("Hello World ! (1)").unwrap();
        client.await_response(first, Duration::from_secs(2)).unwrap();
        let received = responses.try_recv().unwrap();
        assert_eq!(received.correlation_id, first);
        assert_eq!(AsciiText::decode(&received.payload).unwrap().as_str(), "Hello World ! (1)");

        let second = client.submit(&[0xFF]).unwrap();
        match client.await_response(second, Duration::from_secs(2)) {
            Err(ClientError::Rejected { correlation_id, detail }) => {
                assert_eq!(correlation_id, second);
                assert_eq!(detail, "bad payload");
            }
            other => panic!("Expected Rejected, got {:?}", other),
        }
        assert_eq!(client.outstanding(), 0);
        assert!(responses.try_recv().is_err());
        leader.join().unwrap();
    }

    #[test]
    fn test_connect_times_out_without_members() {
        let network = InMemoryNetwork::new();
        let (listener, _responses) = ChannelListener::new();
        let mut config = config("0=localhost:9002");
        config.connect_timeout_ms = 20;

        let result = ClusterClient::connect(config, Arc::new(network), listener);
        assert!(matches!(result, Err(ClientError::ConnectTimeout)));
    }

    #[test]
    fn test_non_ascii_text_is_not_submitted() {
        let network = InMemoryNetwork::new();
        let leader = fake_leader(network.clone(), "localhost:9002", 0);
        let (listener, _responses) = ChannelListener::new();
        let mut client = ClusterClient::connect(config("0=localhost:9002"), Arc::new(network), listener).unwrap();

        assert!(matches!(client.submit_text("héllo"), Err(ClientError::Codec(_))));
        assert_eq!(client.outstanding(), 0);
        leader.join().unwrap();
    }

    #[test]
    fn test_await_unanswered_times_out() {
        let network = InMemoryNetwork::new();
        let leader = fake_leader(network.clone(), "localhost:9002", 0);
        let (listener, _responses) = ChannelListener::new();
        let mut client = ClusterClient::connect(config("0=localhost:9002"), Arc::new(network), listener).unwrap();
        let _endpoint = leader.join().unwrap();

        let id = client.submit_integer(5).unwrap();
        assert!(matches!(
            client.await_response(id, Duration::from_millis(20)),
            Err(ClientError::ResponseTimeout { correlation_id }) if correlation_id == id
        ));
        assert_eq!(client.overdue(Instant::now() + Duration::from_secs(60)), Some(id));
    }

    #[test]
    fn test_closed_client_rejects_submit() {
        let network = InMemoryNetwork::new();
        let leader = fake_leader(network.clone(), "localhost:9002", 0);
        let (listener, _responses) = ChannelListener::new();
        let mut client = ClusterClient::connect(config("0=localhost:9002"), Arc::new(network), listener).unwrap();
        let _endpoint = leader.join().unwrap();

        client.close().unwrap();
        assert!(client.is_closed());
        assert!(matches!(client.submit_integer(1), Err(ClientError::SessionClosed { session_id: 7 })));
    }

    #[test]
    fn test_next_member_wraps() {
        let members: BTreeMap<u32, String> = [(0, "a:1".to_string()), (2, "b:1".to_string())].into();
        assert_eq!(next_member(&members, 0), 2);
        assert_eq!(next_member(&members, 2), 0);

        let members: BTreeMap<u32, String> = [(0, "a:1".to_string()), (u32::MAX, "b:1".to_string())].into();
        assert_eq!(next_member(&members, u32::MAX), 0);
    }

    fn session_event(correlation_id: u64, leadership_term: u64, leader_member_id: u32, code: EventCode) -> Vec<u8> {
        EgressMessage::SessionEvent {
            session_id: 7,
            correlation_id,
            leadership_term,
            leader_member_id,
            code,
            detail: String::new(),
        }
        .serialize()
    }

    #[test]
    fn test_new_leader_in_connect_batch_is_kept() {
        let network = InMemoryNetwork::new();
        let mut ingress = network.bind("localhost:9002", 64).unwrap();
        let _standby = network.bind("localhost:9102", 64).unwrap();
        let peer = network.clone();
        let leader = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                let mut response_endpoint = None;
                ingress.poll(
                    &mut |b| {
                        if let Ok(IngressMessage::Connect { response_endpoint: e, .. }) = IngressMessage::deserialize(b) {
                            response_endpoint = Some(e);
                        }
                    },
                    16,
                );
                if let Some(endpoint) = response_endpoint {
                    let mut egress = peer.connect(&endpoint).unwrap();
                    egress.offer(&session_event(CONNECT_CORRELATION_ID, 1, 0, EventCode::Ok));
                    egress.offer(
                        &EgressMessage::NewLeader {
                            session_id: 7,
                            leadership_term: 2,
                            leader_member_id: 1,
                        }
                        .serialize(),
                    );
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            ingress
        });

        let (listener, _responses) = ChannelListener::new();
        let mut client = ClusterClient::connect(
            config("0=localhost:9002,1=localhost:9102"),
            Arc::new(network),
            listener,
        )
        .unwrap();
        let _ingress = leader.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while client.leader_member_id() != 1 && Instant::now() < deadline {
            client.poll_responses();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(client.leader_member_id(), 1);
        assert_eq!(client.leadership_term(), 2);
    }

    #[test]
    fn test_redirected_message_is_resubmitted_to_leader() {
        let network = InMemoryNetwork::new();
        let mut old_leader = network.bind("localhost:9002", 64).unwrap();
        let mut new_leader = network.bind("localhost:9102", 64).unwrap();
        let peer = network.clone();
        let cluster = thread::spawn(move || {
            let mut egress: Option<Box<dyn Publication + Send>> = None;
            let mut answered = false;
            let deadline = Instant::now() + Duration::from_secs(5);
            while !answered && Instant::now() < deadline {
                let mut received = Vec::new();
                old_leader.poll(&mut |b| received.push(IngressMessage::deserialize(b).unwrap()), 16);
                for message in received {
                    let reply = match message {
                        IngressMessage::Connect {
                            correlation_id,
                            response_endpoint,
                        } => {
                            egress = Some(peer.connect(&response_endpoint).unwrap());
                            session_event(correlation_id, 1, 0, EventCode::Ok)
                        }
                        // Member 0 lost leadership before sequencing the message.
                        IngressMessage::SessionMessage { correlation_id, .. } => {
                            session_event(correlation_id, 2, 1, EventCode::Redirect)
                        }
                        _ => continue,
                    };
                    if let Some(egress) = egress.as_mut() {
                        egress.offer(&reply);
                    }
                }

                let mut received = Vec::new();
                new_leader.poll(&mut |b| received.push(IngressMessage::deserialize(b).unwrap()), 16);
                for message in received {
                    if let IngressMessage::SessionMessage {
                        session_id,
                        correlation_id,
                        payload,
                    } = message
                    {
                        let reply = EgressMessage::Response {
                            session_id,
                            correlation_id,
                            timestamp: 0,
                            payload,
                        };
                        if let Some(egress) = egress.as_mut() {
                            egress.offer(&reply.serialize());
                        }
                        answered = true;
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
            (old_leader, new_leader)
        });

        let (listener, responses) = ChannelListener::new();
        let mut client = ClusterClient::connect(
            config("0=localhost:9002,1=localhost:9102"),
            Arc::new(network),
            listener,
        )
        .unwrap();
        let id = client.submit_integer(42).unwrap();
        client.await_response(id, Duration::from_secs(2)).unwrap();

        assert_eq!(client.leader_member_id(), 1);
        assert_eq!(client.leadership_term(), 2);
        let received = responses.try_recv().unwrap();
        assert_eq!(received.correlation_id, id);
        assert_eq!(i64::decode(&received.payload).unwrap(), 42);
        assert!(client.take_rejection().is_none());
        let _endpoints = cluster.join().unwrap();
    }

    #[test]
    fn test_redirect_to_unknown_leader_fails_message() {
        let network = InMemoryNetwork::new();
        let mut ingress = network.bind("localhost:9002", 64).unwrap();
        let peer = network.clone();
        let member = thread::spawn(move || {
            let mut egress: Option<Box<dyn Publication + Send>> = None;
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut redirected = false;
            while !redirected && Instant::now() < deadline {
                let mut received = Vec::new();
                ingress.poll(&mut |b| received.push(IngressMessage::deserialize(b).unwrap()), 16);
                for message in received {
                    let reply = match message {
                        IngressMessage::Connect {
                            correlation_id,
                            response_endpoint,
                        } => {
                            egress = Some(peer.connect(&response_endpoint).unwrap());
                            session_event(correlation_id, 1, 0, EventCode::Ok)
                        }
                        IngressMessage::SessionMessage { correlation_id, .. } => {
                            redirected = true;
                            session_event(correlation_id, 2, 5, EventCode::Redirect)
                        }
                        _ => continue,
                    };
                    if let Some(egress) = egress.as_mut() {
                        egress.offer(&reply);
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
            ingress
        });

        let (listener, _responses) = ChannelListener::new();
        let mut client = ClusterClient::connect(config("0=localhost:9002"), Arc::new(network), listener).unwrap();
        let id = client.submit_integer(1).unwrap();
        assert!(matches!(
            client.await_response(id, Duration::from_secs(2)),
            Err(ClientError::Rejected { correlation_id, .. }) if correlation_id == id
        ));
        assert_eq!(client.outstanding(), 0);
        assert_eq!(client.leader_member_id(), 0);
        let _endpoint = member.join().unwrap();
    }
}
