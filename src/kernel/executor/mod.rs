mod error;
mod recovery;
mod snapshot_ops;
mod step;


use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, info};

use crate::config::DEFAULT_SNAPSHOT_THRESHOLD;
use crate::kernel::snapshot::Recorder;
use crate::kernel::traits::{ClientSession, ClusteredService, Role, SessionId};

pub use error::{Effect, ExecutorStatus, FatalError, StepResult};

/// Called once when the executor halts.
pub type TerminationHook = Box<dyn FnOnce(&FatalError) + Send>;

/// The node-side service container.
///
/// Owns:
/// - One ClusteredService and its replicated state
/// - The replicated session registry
/// - One execution cursor (next_position)
/// - One terminal status: Running | Halted
/// - One snapshot recorder
pub struct Executor<S: ClusteredService> {
    pub(crate) service: S,

    pub(crate) state: S::State,

    /// Open sessions. Replicated: identical on every node at a given position.
    pub(crate) sessions: BTreeMap<SessionId, ClientSession>,

    /// This node's member id. Only used to derive the role.
    pub(crate) member_id: u32,

    pub(crate) leadership_term: u64,

    pub(crate) leader_member_id: Option<u32>,

    pub(crate) role: Role,

    /// The next position to apply.
    pub(crate) next_position: u64,

    pub(crate) status: ExecutorStatus,

    pub(crate) recorder: Box<dyn Recorder>,

    /// Position of the last snapshot taken or restored.
    pub(crate) last_snapshot_position: Option<u64>,

    /// Entries between automatic snapshots. Zero disables them.
    pub(crate) snapshot_threshold: u64,

    /// Running digest over every response produced.
    pub(crate) digest: [u8; 16],

    pub(crate) termination_hook: Option<TerminationHook>,
}

/// Replicated state an executor starts from.
pub(crate) struct BaseState<T> {
    pub state: T,
    pub sessions: BTreeMap<SessionId, ClientSession>,
    pub leadership_term: u64,
    pub leader_member_id: Option<u32>,
    pub snapshot_position: Option<u64>,
    pub digest: [u8; 16],
}

impl<S: ClusteredService> Executor<S> {
    /// Create an executor at genesis. The first entry applied is position 1.
    pub fn new(service: S, member_id: u32, recorder: Box<dyn Recorder>) -> Self {
        let base = BaseState {
            state: service.genesis(),
            sessions: BTreeMap::new(),
            leadership_term: 0,
            leader_member_id: None,
            snapshot_position: None,
            digest: [0u8; 16],
        };
        Self::start(service, member_id, recorder, base)
    }

    pub(crate) fn start(
        service: S,
        member_id: u32,
        recorder: Box<dyn Recorder>,
        base: BaseState<S::State>,
    ) -> Self {
        let role = match base.leader_member_id {
            Some(leader) if leader == member_id => Role::Leader,
            _ => Role::Follower,
        };
        let mut executor = Executor {
            service,
            state: base.state,
            sessions: base.sessions,
            member_id,
            leadership_term: base.leadership_term,
            leader_member_id: base.leader_member_id,
            role,
            next_position: base.snapshot_position.map_or(1, |p| p + 1),
            status: ExecutorStatus::Running,
            recorder,
            last_snapshot_position: base.snapshot_position,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            digest: base.digest,
            termination_hook: None,
        };

        let snapshot_position = base.snapshot_position;
        let position = executor.next_position;
        let started = executor.guarded(position, |service, state| {
            service.on_start(state, snapshot_position);
            if role == Role::Leader {
                service.on_role_change(Role::Leader);
            }
        });
        if let Err(e) = started {
            error!(member_id, error = %e, "service failed to start");
        }
        executor
    }

    /// Run `f` against the service, turning a panic into a halt.
    pub(crate) fn guarded<T>(
        &mut self,
        position: u64,
        f: impl FnOnce(&S, &S::State) -> T,
    ) -> Result<T, FatalError> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(&self.service, &self.state)));
        result.map_err(|panic_info| {
            let message = if let Some(msg) = panic_info.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic_info.downcast_ref::<String>() {
                msg.clone()
            } else {
                "<unknown panic>".to_string()
            };
            self.halt(FatalError::PoisonPill { position, message })
        })
    }

    /// Halt, notify the service and fire the termination hook. Idempotent.
    pub fn halt(&mut self, fatal: FatalError) -> FatalError {
        if self.status == ExecutorStatus::Halted {
            return fatal;
        }
        self.status = ExecutorStatus::Halted;
        error!(member_id = self.member_id, next_position = self.next_position, error = %fatal, "executor halted");

        let terminated = panic::catch_unwind(AssertUnwindSafe(|| self.service.on_terminate(&self.state)));
        if terminated.is_err() {
            error!(member_id = self.member_id, "on_terminate panicked");
        }
        if let Some(hook) = self.termination_hook.take() {
            hook(&fatal);
        }
        fatal
    }

    /// Halt because the substrate under this node failed.
    pub fn fault(&mut self, reason: impl Into<String>) -> FatalError {
        self.halt(FatalError::SubstrateFault(reason.into()))
    }

    /// Install the hook fired when the executor halts.
    ///
    /// If the executor is already halted the hook is dropped unfired.
    pub fn set_termination_hook(&mut self, hook: TerminationHook) {
        if self.status == ExecutorStatus::Running {
            self.termination_hook = Some(hook);
        } else {
            info!(member_id = self.member_id, "executor already halted, termination hook not installed");
        }
    }

    pub fn state(&self) -> &S::State {
        &self.state
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn sessions(&self) -> &BTreeMap<SessionId, ClientSession> {
        &self.sessions
    }

    pub fn is_session_open(&self, session_id: SessionId) -> bool {
        self.sessions.get(&session_id).map_or(false, ClientSession::is_open)
    }

    /// Get the next position to be applied.
    pub fn next_position(&self) -> u64 {
        self.next_position
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status
    }

    pub fn is_halted(&self) -> bool {
        self.status == ExecutorStatus::Halted
    }

    pub fn member_id(&self) -> u32 {
        self.member_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leadership_term(&self) -> u64 {
        self.leadership_term
    }

    pub fn leader_member_id(&self) -> Option<u32> {
        self.leader_member_id
    }

    /// Digest over every response produced so far. Equal on every node that
    /// applied the same log prefix.
    pub fn digest(&self) -> [u8; 16] {
        self.digest
    }
}
