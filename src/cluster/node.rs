//! Threaded node runner.
//!
//! Each node runs in its own thread and owns its executor, so committed
//! entries are applied strictly one at a time in position order. The thread
//! polls the log, steps the executor, carries out the resulting effects
//! through the session manager, and answers commands from its handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::backpressure::{BackoffIdleStrategy, IdleStrategy};
use crate::config::NodeConfig;
use crate::error::Error;
use crate::kernel::executor::{Effect, Executor, FatalError, TerminationHook};
use crate::kernel::session::SessionManager;
use crate::kernel::snapshot::{FileRecorder, Recorder};
use crate::kernel::traits::{ClusteredService, Role, SessionId};

use super::message::{EgressMessage, EventCode, LogEntry};
use super::substrate::{LogControl, LogSubscription, OrderedLog, Transport};

/// Committed entries applied per duty cycle.
const LOG_POLL_LIMIT: usize = 256;

/// How long a handle waits for its node to answer.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands that can be sent to a node thread.
#[derive(Debug)]
pub enum NodeCommand {
    /// Take a snapshot now.
    TakeSnapshot(Sender<Result<u64, FatalError>>),
    /// Get current state for verification.
    GetState(Sender<NodeState>),
    /// Stop the node thread.
    Stop,
}

/// State snapshot from a node for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub member_id: u32,
    pub role: Role,
    pub leadership_term: u64,
    pub next_position: u64,
    pub last_snapshot_position: Option<u64>,
    pub open_sessions: Vec<SessionId>,
    pub digest: [u8; 16],
    pub halted: bool,
}

/// Everything a node consumes from outside the core.
pub struct NodeSubstrate {
    pub transport: Arc<dyn Transport>,
    pub log: Arc<dyn OrderedLog>,
    pub recorder: Box<dyn Recorder>,
}

impl NodeSubstrate {
    /// Substrate recording snapshots under `config.snapshot_dir()`.
    pub fn with_file_recorder(config: &NodeConfig, transport: Arc<dyn Transport>, log: Arc<dyn OrderedLog>) -> Self {
        NodeSubstrate {
            transport,
            log,
            recorder: Box::new(FileRecorder::new(config.snapshot_dir(), config.snapshots_retained)),
        }
    }
}

/// Handle to a running node thread.
pub struct NodeHandle {
    member_id: u32,
    command_tx: Sender<NodeCommand>,
    thread_handle: Option<JoinHandle<()>>,
    halted: Arc<AtomicBool>,
}

impl NodeHandle {
    pub fn member_id(&self) -> u32 {
        self.member_id
    }

    /// Get current node state. None once the node thread has exited.
    pub fn get_state(&self) -> Option<NodeState> {
        let (resp_tx, resp_rx) = bounded(1);
        if self.command_tx.send(NodeCommand::GetState(resp_tx)).is_ok() {
            resp_rx.recv_timeout(COMMAND_TIMEOUT).ok()
        } else {
            None
        }
    }

    /// Ask the node to snapshot at its last applied position.
    pub fn take_snapshot(&self) -> Result<u64, Error> {
        let (resp_tx, resp_rx) = bounded(1);
        self.command_tx
            .send(NodeCommand::TakeSnapshot(resp_tx))
            .map_err(|_| Error::SubstrateFault(format!("node {} is not running", self.member_id)))?;
        let result = resp_rx
            .recv_timeout(COMMAND_TIMEOUT)
            .map_err(|_| Error::SubstrateFault(format!("node {} did not answer", self.member_id)))?;
        Ok(result?)
    }

    /// True once the node halted on a fatal error.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop the node thread.
    pub fn stop(&mut self) {
        let _ = self.command_tx.send(NodeCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The node runner that executes in its own thread.
struct NodeRunner<S: ClusteredService> {
    member_id: u32,
    executor: Executor<S>,
    sessions: SessionManager,
    log: Box<dyn LogSubscription>,
    control: Box<dyn LogControl>,
    /// Entries up to here were committed before this node started. Their
    /// control requests already reached the log once.
    replay_until: u64,
    command_rx: Receiver<NodeCommand>,
    idle: BackoffIdleStrategy,
}

impl<S: ClusteredService> NodeRunner<S> {
    fn run(&mut self) {
        loop {
            while let Ok(cmd) = self.command_rx.try_recv() {
                match cmd {
                    NodeCommand::TakeSnapshot(resp_tx) => {
                        let _ = resp_tx.send(self.executor.take_snapshot());
                    }
                    NodeCommand::GetState(resp_tx) => {
                        let _ = resp_tx.send(self.state());
                    }
                    NodeCommand::Stop => {
                        info!(member_id = self.member_id, "node stopped");
                        return;
                    }
                }
            }
            if self.executor.is_halted() {
                // Only state queries are served once halted.
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            let mut work = match self.poll_log() {
                Ok(applied) => applied,
                Err(fatal) => {
                    error!(member_id = self.member_id, error = %fatal, "node halted");
                    continue;
                }
            };

            if self.executor.should_snapshot() {
                if let Err(e) = self.executor.take_snapshot() {
                    warn!(member_id = self.member_id, error = %e, "automatic snapshot failed");
                }
            }

            work += self.sessions.flush();
            self.idle.idle_with(work);
        }
    }

    fn state(&self) -> NodeState {
        NodeState {
            member_id: self.member_id,
            role: self.executor.role(),
            leadership_term: self.executor.leadership_term(),
            next_position: self.executor.next_position(),
            last_snapshot_position: self.executor.last_snapshot_position(),
            open_sessions: self.executor.sessions().keys().copied().collect(),
            digest: self.executor.digest(),
            halted: self.executor.is_halted(),
        }
    }

    fn poll_log(&mut self) -> Result<usize, FatalError> {
        let mut batch: Vec<LogEntry> = Vec::new();
        if let Err(e) = self.log.poll(&mut |entry| batch.push(entry), LOG_POLL_LIMIT) {
            return Err(self.executor.fault(e.to_string()));
        }

        let applied = batch.len();
        for entry in batch {
            let replayed = entry.position <= self.replay_until;
            let result = self.executor.step(entry)?;
            for effect in result.effects() {
                self.apply_effect(effect, replayed);
            }
        }
        Ok(applied)
    }

    fn apply_effect(&mut self, effect: &Effect, replayed: bool) {
        let leadership_term = self.executor.leadership_term();
        let leader_member_id = self.executor.leader_member_id().unwrap_or(self.member_id);

        match effect {
            Effect::SessionOpened {
                session_id,
                correlation_id,
                response_endpoint,
            } => {
                self.sessions.open(*session_id, response_endpoint);
                self.sessions.deliver(&EgressMessage::SessionEvent {
                    session_id: *session_id,
                    correlation_id: *correlation_id,
                    leadership_term,
                    leader_member_id,
                    code: EventCode::Ok,
                    detail: String::new(),
                });
            }
            Effect::SessionClosed { session_id, reason } => {
                self.sessions.deliver(&EgressMessage::SessionEvent {
                    session_id: *session_id,
                    correlation_id: 0,
                    leadership_term,
                    leader_member_id,
                    code: EventCode::Closed,
                    detail: reason.to_string(),
                });
                self.sessions.close(*session_id);
            }
            Effect::Response {
                session_id,
                correlation_id,
                timestamp,
                payload,
            } => {
                self.sessions.deliver(&EgressMessage::Response {
                    session_id: *session_id,
                    correlation_id: *correlation_id,
                    timestamp: timestamp.as_nanos(),
                    payload: payload.clone(),
                });
            }
            Effect::Rejected {
                session_id,
                correlation_id,
                detail,
            } => {
                self.sessions.deliver(&EgressMessage::SessionEvent {
                    session_id: *session_id,
                    correlation_id: *correlation_id,
                    leadership_term,
                    leader_member_id,
                    code: EventCode::Error,
                    detail: detail.clone(),
                });
            }
            Effect::Control(request) => {
                if replayed {
                    debug!(member_id = self.member_id, ?request, "replayed control request not forwarded");
                } else if self.executor.role() == Role::Leader {
                    if let Err(e) = self.control.request(request.clone()) {
                        warn!(member_id = self.member_id, error = %e, ?request, "control request not delivered");
                    }
                }
            }
            Effect::LeadershipChanged {
                leadership_term,
                leader_member_id,
                role,
            } => {
                let was_leader = self.sessions.role() == Role::Leader;
                self.sessions.set_role(*role);
                if *role == Role::Leader && !was_leader {
                    let term = *leadership_term;
                    let leader = *leader_member_id;
                    let announced = self.sessions.broadcast(|session_id| EgressMessage::NewLeader {
                        session_id,
                        leadership_term: term,
                        leader_member_id: leader,
                    });
                    debug!(member_id = self.member_id, term, announced, "announced leadership to sessions");
                }
            }
        }
    }
}

/// Recover a node from its recorder and start it in its own thread.
///
/// `hook` fires once if the node halts on a fatal error.
pub fn spawn_node<S: ClusteredService>(
    config: NodeConfig,
    service: S,
    substrate: NodeSubstrate,
    hook: Option<TerminationHook>,
) -> Result<NodeHandle, Error> {
    config.validate()?;
    let member_id = config.member_id;

    let mut executor = Executor::recover(service, member_id, substrate.recorder)?;
    executor.set_snapshot_threshold(config.snapshot_threshold);

    let halted = Arc::new(AtomicBool::new(false));
    let halted_flag = halted.clone();
    executor.set_termination_hook(Box::new(move |fatal: &FatalError| {
        halted_flag.store(true, Ordering::SeqCst);
        if let Some(hook) = hook {
            hook(fatal);
        }
    }));

    let replay_until = substrate.log.committed_position();
    let log = substrate.log.subscribe(executor.next_position())?;
    let control = substrate.log.control(member_id);

    let mut sessions = SessionManager::new(&config, substrate.transport);
    sessions.restore(executor.sessions());
    sessions.set_role(executor.role());

    info!(
        member_id,
        next_position = executor.next_position(),
        role = %executor.role(),
        "node starting"
    );

    let (command_tx, command_rx) = bounded(100);
    let mut runner = NodeRunner {
        member_id,
        executor,
        sessions,
        log,
        control,
        replay_until,
        command_rx,
        idle: BackoffIdleStrategy::from_config(&config.idle),
    };
    let thread_handle = thread::spawn(move || runner.run());

    Ok(NodeHandle {
        member_id,
        command_tx,
        thread_handle: Some(thread_handle),
        halted,
    })
}
