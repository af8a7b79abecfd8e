//! In-process ordered log.
//!
//! A single sequencer thread owns every member's client endpoint. It turns
//! ingress into committed entries, assigns session ids and cluster time, and
//! fans each entry out to every subscribed node in position order. It is a
//! stand-in for a replicated log: entries live in memory and nothing is
//! durable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::{debug, info, trace, warn};

use crate::backpressure::{BackoffIdleStrategy, IdleStrategy};
use crate::config::IdleConfig;
use crate::kernel::traits::{CloseReason, SessionId};

use super::membership::ClusterMember;
use super::message::{ControlRequest, EgressMessage, EventCode, IngressMessage, LogBody, LogEntry};
use super::substrate::{LogControl, LogSubscription, OrderedLog, Subscription, Transport, TransportError};

/// Ingress buffers handled per member per duty cycle.
const INGRESS_POLL_LIMIT: usize = 64;

/// Name reported when the log is gone.
const LOG_ENDPOINT: &str = "ordered-log";

#[derive(Clone, Debug)]
pub struct SequencerConfig {
    /// Leader of the first term.
    pub initial_leader: u32,
    /// Inactivity after which a session is closed with `Timeout`.
    pub session_timeout: Duration,
    /// Capacity of each member's client endpoint.
    pub ingress_capacity: usize,
    pub idle: IdleConfig,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        SequencerConfig {
            initial_leader: 0,
            session_timeout: Duration::from_secs(10),
            ingress_capacity: 1024,
            idle: IdleConfig::default(),
        }
    }
}

/// Committed entries plus the subscribers they are fanned out to.
struct LogStore {
    entries: Vec<LogEntry>,
    subscribers: Vec<Sender<LogEntry>>,
    leadership_term: u64,
    leader_member_id: u32,
    last_timestamp: u64,
    closed: bool,
}

impl LogStore {
    fn append(&mut self, body: LogBody) -> u64 {
        let position = self.entries.len() as u64 + 1;
        let timestamp = wall_clock_nanos().max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;

        let entry = LogEntry {
            position,
            timestamp,
            body,
        };
        trace!(position, ?entry.body, "committed");
        self.subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
        self.entries.push(entry);
        position
    }

    fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
    }
}

fn wall_clock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn lock(store: &Mutex<LogStore>) -> MutexGuard<'_, LogStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable access to the log. Implements [`OrderedLog`] for nodes.
#[derive(Clone)]
pub struct SequencerHandle {
    store: Arc<Mutex<LogStore>>,
    control_tx: Sender<(u32, ControlRequest)>,
}

impl SequencerHandle {
    /// Start a new leadership term led by `leader_member_id`.
    pub fn elect(&self, leader_member_id: u32) -> u64 {
        let mut store = lock(&self.store);
        store.leadership_term += 1;
        store.leader_member_id = leader_member_id;
        let term = store.leadership_term;
        info!(term, leader_member_id, "new leadership term");
        store.append(LogBody::NewLeadershipTerm {
            term,
            leader_member_id,
        })
    }

    pub fn leader(&self) -> u32 {
        lock(&self.store).leader_member_id
    }

    pub fn leadership_term(&self) -> u64 {
        lock(&self.store).leadership_term
    }

    /// Position of the last committed entry, 0 when empty.
    pub fn last_position(&self) -> u64 {
        lock(&self.store).entries.len() as u64
    }

    /// Copy of every committed entry.
    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.store).entries.clone()
    }

    /// Commit `body` directly, bypassing ingress.
    pub fn append(&self, body: LogBody) -> u64 {
        lock(&self.store).append(body)
    }
}

impl OrderedLog for SequencerHandle {
    fn subscribe(&self, from_position: u64) -> Result<Box<dyn LogSubscription>, TransportError> {
        let mut store = lock(&self.store);
        if store.closed {
            return Err(TransportError::Closed {
                endpoint: LOG_ENDPOINT.to_string(),
            });
        }
        let (tx, rx) = unbounded();
        let start = from_position.max(1) as usize - 1;
        for entry in store.entries.iter().skip(start) {
            // The receiver is still in scope.
            let _ = tx.send(entry.clone());
        }
        store.subscribers.push(tx);
        Ok(Box::new(LogReceiver { rx }))
    }

    fn control(&self, member_id: u32) -> Box<dyn LogControl> {
        Box::new(MemberControl {
            member_id,
            tx: self.control_tx.clone(),
        })
    }

    fn committed_position(&self) -> u64 {
        self.last_position()
    }
}

/// A node's view of committed entries.
pub struct LogReceiver {
    rx: Receiver<LogEntry>,
}

impl LogSubscription for LogReceiver {
    fn poll(&mut self, handler: &mut dyn FnMut(LogEntry), limit: usize) -> Result<usize, TransportError> {
        let mut delivered = 0;
        while delivered < limit {
            match self.rx.try_recv() {
                Ok(entry) => {
                    handler(entry);
                    delivered += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if delivered == 0 {
                        return Err(TransportError::Closed {
                            endpoint: LOG_ENDPOINT.to_string(),
                        });
                    }
                    break;
                }
            }
        }
        Ok(delivered)
    }
}

/// Control channel from one member to the sequencer.
pub struct MemberControl {
    member_id: u32,
    tx: Sender<(u32, ControlRequest)>,
}

impl LogControl for MemberControl {
    fn request(&self, request: ControlRequest) -> Result<(), TransportError> {
        self.tx
            .send((self.member_id, request))
            .map_err(|_| TransportError::Closed {
                endpoint: LOG_ENDPOINT.to_string(),
            })
    }
}

/// Running sequencer. Stops on drop.
pub struct Sequencer {
    handle: SequencerHandle,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Sequencer {
    /// Bind every member's client endpoint, commit the first term and start
    /// sequencing.
    pub fn start(
        config: SequencerConfig,
        members: &[ClusterMember],
        transport: Arc<dyn Transport>,
    ) -> Result<Self, TransportError> {
        let mut ingress = Vec::with_capacity(members.len());
        for member in members {
            let subscription = transport.bind(&member.client_endpoint(), config.ingress_capacity)?;
            ingress.push((member.member_id, subscription));
        }

        let store = Arc::new(Mutex::new(LogStore {
            entries: Vec::new(),
            subscribers: Vec::new(),
            leadership_term: 0,
            leader_member_id: config.initial_leader,
            last_timestamp: 0,
            closed: false,
        }));
        let (control_tx, control_rx) = unbounded();
        let handle = SequencerHandle {
            store: store.clone(),
            control_tx,
        };
        handle.elect(config.initial_leader);

        let running = Arc::new(AtomicBool::new(true));
        let mut runner = SequencerRunner {
            store,
            transport,
            members: members.iter().map(|m| (m.member_id, m.client_endpoint())).collect(),
            ingress,
            control_rx,
            sessions: BTreeMap::new(),
            next_session_id: 1,
            timers: BTreeMap::new(),
            session_timeout: config.session_timeout,
            idle: BackoffIdleStrategy::from_config(&config.idle),
            running: running.clone(),
        };
        let thread = thread::spawn(move || runner.run());

        Ok(Sequencer {
            handle,
            running,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SequencerHandle {
        self.handle.clone()
    }

    /// Stop sequencing. Subscribed nodes see the log close.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SessionActivity {
    response_endpoint: String,
    last_activity: Instant,
}

struct SequencerRunner {
    store: Arc<Mutex<LogStore>>,
    transport: Arc<dyn Transport>,
    members: BTreeMap<u32, String>,
    ingress: Vec<(u32, Box<dyn Subscription + Send>)>,
    control_rx: Receiver<(u32, ControlRequest)>,
    sessions: BTreeMap<SessionId, SessionActivity>,
    next_session_id: SessionId,
    /// Pending timers: correlation id to deadline in cluster nanoseconds.
    timers: BTreeMap<u64, u64>,
    session_timeout: Duration,
    idle: BackoffIdleStrategy,
    running: Arc<AtomicBool>,
}

impl SequencerRunner {
    fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            let mut work = self.poll_ingress();
            work += self.poll_control();
            work += self.expire_sessions(Instant::now());
            work += self.fire_timers(wall_clock_nanos());
            self.idle.idle_with(work);
        }
        lock(&self.store).close();
        debug!("sequencer stopped");
    }

    fn poll_ingress(&mut self) -> usize {
        let mut received = Vec::new();
        for (member_id, subscription) in self.ingress.iter_mut() {
            let member_id = *member_id;
            subscription.poll(&mut |bytes| received.push((member_id, bytes.to_vec())), INGRESS_POLL_LIMIT);
        }

        let work = received.len();
        for (member_id, bytes) in received {
            match IngressMessage::deserialize(&bytes) {
                Ok(message) => self.on_ingress(member_id, message),
                Err(e) => warn!(member_id, error = %e, "malformed ingress dropped"),
            }
        }
        work
    }

    fn on_ingress(&mut self, member_id: u32, message: IngressMessage) {
        let (term, leader) = {
            let store = lock(&self.store);
            (store.leadership_term, store.leader_member_id)
        };

        match message {
            IngressMessage::Connect {
                correlation_id,
                response_endpoint,
            } => {
                if member_id != leader {
                    debug!(member_id, leader, correlation_id, "connect to follower redirected");
                    let detail = self.members.get(&leader).cloned().unwrap_or_default();
                    self.notify(
                        &response_endpoint,
                        &EgressMessage::SessionEvent {
                            session_id: 0,
                            correlation_id,
                            leadership_term: term,
                            leader_member_id: leader,
                            code: EventCode::Redirect,
                            detail,
                        },
                    );
                    return;
                }

                let session_id = self.next_session_id;
                self.next_session_id += 1;
                self.sessions.insert(
                    session_id,
                    SessionActivity {
                        response_endpoint: response_endpoint.clone(),
                        last_activity: Instant::now(),
                    },
                );
                let position = lock(&self.store).append(LogBody::SessionOpen {
                    session_id,
                    correlation_id,
                    response_endpoint,
                });
                debug!(session_id, position, "session open committed");
            }
            IngressMessage::SessionMessage {
                session_id,
                correlation_id,
                payload,
            } => {
                let Some(activity) = self.sessions.get_mut(&session_id) else {
                    debug!(session_id, correlation_id, "message for unknown session dropped");
                    return;
                };
                if member_id != leader {
                    let endpoint = activity.response_endpoint.clone();
                    debug!(member_id, leader, session_id, correlation_id, "message to follower redirected");
                    let detail = self.members.get(&leader).cloned().unwrap_or_default();
                    self.notify(
                        &endpoint,
                        &EgressMessage::SessionEvent {
                            session_id,
                            correlation_id,
                            leadership_term: term,
                            leader_member_id: leader,
                            code: EventCode::Redirect,
                            detail,
                        },
                    );
                    return;
                }
                activity.last_activity = Instant::now();
                lock(&self.store).append(LogBody::SessionMessage {
                    session_id,
                    correlation_id,
                    payload,
                });
            }
            IngressMessage::KeepAlive { session_id } => {
                if let Some(activity) = self.sessions.get_mut(&session_id) {
                    activity.last_activity = Instant::now();
                }
            }
            IngressMessage::Close { session_id } => {
                self.close_session(session_id, CloseReason::ClientAction);
            }
        }
    }

    fn poll_control(&mut self) -> usize {
        let requests: Vec<_> = self.control_rx.try_iter().collect();
        let leader = lock(&self.store).leader_member_id;
        let work = requests.len();

        for (member_id, request) in requests {
            if member_id != leader {
                trace!(member_id, ?request, "control request from follower ignored");
                continue;
            }
            match request {
                ControlRequest::ScheduleTimer {
                    correlation_id,
                    deadline,
                } => {
                    self.timers.insert(correlation_id, deadline);
                }
                ControlRequest::CancelTimer { correlation_id } => {
                    self.timers.remove(&correlation_id);
                }
                ControlRequest::CloseSession { session_id } => {
                    self.close_session(session_id, CloseReason::ServiceAction);
                }
            }
        }
        work
    }

    fn expire_sessions(&mut self, now: Instant) -> usize {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, a)| now.duration_since(a.last_activity) >= self.session_timeout)
            .map(|(&id, _)| id)
            .collect();
        for &session_id in &expired {
            info!(session_id, timeout = ?self.session_timeout, "session timed out");
            self.close_session(session_id, CloseReason::Timeout);
        }
        expired.len()
    }

    fn fire_timers(&mut self, now_nanos: u64) -> usize {
        let due: Vec<u64> = self
            .timers
            .iter()
            .filter(|(_, &deadline)| deadline <= now_nanos)
            .map(|(&id, _)| id)
            .collect();
        for &correlation_id in &due {
            self.timers.remove(&correlation_id);
            lock(&self.store).append(LogBody::Timer { correlation_id });
        }
        due.len()
    }

    fn close_session(&mut self, session_id: SessionId, reason: CloseReason) {
        if self.sessions.remove(&session_id).is_none() {
            return;
        }
        let position = lock(&self.store).append(LogBody::SessionClose { session_id, reason });
        debug!(session_id, %reason, position, "session close committed");
    }

    /// Best-effort single offer; the client retries its own request.
    fn notify(&self, endpoint: &str, message: &EgressMessage) {
        match self.transport.connect(endpoint) {
            Ok(mut publication) => {
                let outcome = publication.offer(&message.serialize());
                trace!(endpoint, ?outcome, "notification offered");
            }
            Err(e) => debug!(endpoint, error = %e, "notification not delivered"),
        }
    }
}
