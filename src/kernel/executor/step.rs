//! Core step execution logic for the executor.

use tracing::{debug, info, trace};

use crate::cluster::message::{ControlRequest, LogBody, LogEntry};
use crate::kernel::traits::{
    ApplyContext, ClientSession, ClusterTime, ClusteredService, Role, ServiceAction, SessionId, SessionMessage,
    Transition,
};

use super::error::{Effect, ExecutorStatus, FatalError, StepResult};
use super::Executor;

/// Outcome of one service callback, before the cursor moves.
enum Applied<T> {
    Ok(Transition<T>),
    Rejected(String),
}

impl<S: ClusteredService> Executor<S> {
    /// Apply a single committed entry.
    ///
    /// # Semantics
    ///
    /// 1. position < next_position: already applied, return Duplicate
    /// 2. position > next_position: FATAL PositionGap
    /// 3. Construct ApplyContext from the entry
    /// 4. Call the service inside catch_unwind
    /// 5. Handle outcomes:
    ///    - Ok: update state, advance cursor, return Applied
    ///    - Err: state unchanged, advance cursor, return Rejected
    ///    - Panic: halt, return FatalError::PoisonPill
    ///
    /// Once halted, all future calls return FatalError::Halted.
    pub fn step(&mut self, entry: LogEntry) -> Result<StepResult, FatalError> {
        if self.status == ExecutorStatus::Halted {
            return Err(FatalError::Halted);
        }

        let position = entry.position;
        if position < self.next_position {
            trace!(position, next_position = self.next_position, "skipping applied entry");
            return Ok(StepResult::Duplicate { position });
        }
        if position > self.next_position {
            let expected = self.next_position;
            return Err(self.halt(FatalError::PositionGap {
                expected,
                found: position,
            }));
        }

        let timestamp = ClusterTime::from_nanos(entry.timestamp);
        let result = match entry.body {
            LogBody::NewLeadershipTerm { term, leader_member_id } => {
                self.apply_leadership_term(position, term, leader_member_id)?
            }
            LogBody::SessionOpen {
                session_id,
                correlation_id,
                response_endpoint,
            } => self.apply_session_open(position, timestamp, session_id, correlation_id, response_endpoint)?,
            LogBody::SessionMessage {
                session_id,
                correlation_id,
                payload,
            } => {
                let message = SessionMessage {
                    session_id,
                    correlation_id,
                    timestamp,
                    payload,
                };
                self.apply_session_message(position, message)?
            }
            LogBody::SessionClose { session_id, reason } => {
                let Some(mut session) = self.sessions.remove(&session_id) else {
                    self.next_position += 1;
                    return Ok(StepResult::Rejected {
                        position,
                        error: format!("session {} is not open", session_id),
                        effects: Vec::new(),
                    });
                };
                session.close(reason);
                info!(member_id = self.member_id, session_id, %reason, position, "session closed");

                let ctx = self.context(timestamp, position);
                let outcome = self.invoke(position, |service, state| {
                    service.on_session_close(state, &session, reason, &ctx)
                })?;
                let mut effects = vec![Effect::SessionClosed { session_id, reason }];
                self.finish(position, outcome, None, timestamp, &mut effects)
            }
            LogBody::Timer { correlation_id } => {
                let ctx = self.context(timestamp, position);
                let outcome = self.invoke(position, |service, state| {
                    service.on_timer_event(state, correlation_id, &ctx)
                })?;
                let mut effects = Vec::new();
                self.finish(position, outcome, None, timestamp, &mut effects)
            }
        };

        self.next_position += 1;
        Ok(result)
    }

    fn context(&self, timestamp: ClusterTime, position: u64) -> ApplyContext {
        ApplyContext::new(timestamp, position, self.leadership_term)
    }

    fn apply_leadership_term(
        &mut self,
        position: u64,
        term: u64,
        leader_member_id: u32,
    ) -> Result<StepResult, FatalError> {
        self.leadership_term = term;
        self.leader_member_id = Some(leader_member_id);

        let role = if leader_member_id == self.member_id {
            Role::Leader
        } else {
            Role::Follower
        };
        if role != self.role {
            self.role = role;
            info!(member_id = self.member_id, %role, term, leader_member_id, "role changed");
            self.guarded(position, |service, _| service.on_role_change(role))?;
        }

        Ok(StepResult::Applied {
            position,
            effects: vec![Effect::LeadershipChanged {
                leadership_term: term,
                leader_member_id,
                role,
            }],
        })
    }

    fn apply_session_open(
        &mut self,
        position: u64,
        timestamp: ClusterTime,
        session_id: SessionId,
        correlation_id: u64,
        response_endpoint: String,
    ) -> Result<StepResult, FatalError> {
        if self.sessions.contains_key(&session_id) {
            return Ok(StepResult::Rejected {
                position,
                error: format!("session {} is already open", session_id),
                effects: Vec::new(),
            });
        }

        // The log decides which sessions exist; a service error cannot veto it.
        let session = ClientSession::new(session_id, response_endpoint.clone(), timestamp);
        self.sessions.insert(session_id, session.clone());
        info!(member_id = self.member_id, session_id, position, "session opened");

        let ctx = self.context(timestamp, position);
        let outcome = self.invoke(position, |service, state| service.on_session_open(state, &session, &ctx))?;
        let mut effects = vec![Effect::SessionOpened {
            session_id,
            correlation_id,
            response_endpoint,
        }];
        Ok(self.finish(position, outcome, Some((session_id, correlation_id)), timestamp, &mut effects))
    }

    fn apply_session_message(&mut self, position: u64, message: SessionMessage) -> Result<StepResult, FatalError> {
        let session_id = message.session_id;
        let correlation_id = message.correlation_id;
        let timestamp = message.timestamp;

        if !self.is_session_open(session_id) {
            debug!(member_id = self.member_id, session_id, position, "message for session that is not open");
            return Ok(StepResult::Rejected {
                position,
                error: format!("session {} is not open", session_id),
                effects: Vec::new(),
            });
        }

        let ctx = self.context(timestamp, position);
        let outcome = self.invoke(position, |service, state| service.on_session_message(state, message, &ctx))?;

        let mut effects = Vec::new();
        if let Applied::Rejected(detail) = &outcome {
            effects.push(Effect::Rejected {
                session_id,
                correlation_id,
                detail: detail.clone(),
            });
        }
        Ok(self.finish(position, outcome, Some((session_id, correlation_id)), timestamp, &mut effects))
    }

    /// Call a state-changing callback under `guarded`, flattening its error.
    fn invoke<F>(&mut self, position: u64, f: F) -> Result<Applied<S::State>, FatalError>
    where
        F: FnOnce(&S, &S::State) -> Result<Transition<S::State>, S::Error>,
    {
        Ok(match self.guarded(position, f)? {
            Ok(transition) => Applied::Ok(transition),
            Err(e) => Applied::Rejected(e.to_string()),
        })
    }

    /// Commit the outcome of a callback and translate its actions.
    ///
    /// `origin` is the session and correlation id of the entry, if it has one;
    /// `Reply` actions are addressed to it.
    fn finish(
        &mut self,
        position: u64,
        outcome: Applied<S::State>,
        origin: Option<(SessionId, u64)>,
        timestamp: ClusterTime,
        effects: &mut Vec<Effect>,
    ) -> StepResult {
        let actions = match outcome {
            Applied::Ok((state, actions)) => {
                self.state = state;
                actions
            }
            Applied::Rejected(error) => {
                debug!(member_id = self.member_id, position, %error, "entry rejected");
                return StepResult::Rejected {
                    position,
                    error,
                    effects: std::mem::take(effects),
                };
            }
        };

        for action in actions {
            match action {
                ServiceAction::Reply(payload) => match origin {
                    Some((session_id, correlation_id)) if self.is_session_open(session_id) => {
                        self.push_response(position, session_id, correlation_id, timestamp, payload, effects);
                    }
                    _ => debug!(member_id = self.member_id, position, "reply without an open session dropped"),
                },
                ServiceAction::Send { session_id, payload } => {
                    if self.is_session_open(session_id) {
                        self.push_response(position, session_id, 0, timestamp, payload, effects);
                    } else {
                        debug!(member_id = self.member_id, session_id, position, "send to closed session dropped");
                    }
                }
                ServiceAction::ScheduleTimer { correlation_id, deadline } => {
                    effects.push(Effect::Control(ControlRequest::ScheduleTimer {
                        correlation_id,
                        deadline: deadline.as_nanos(),
                    }));
                }
                ServiceAction::CancelTimer { correlation_id } => {
                    effects.push(Effect::Control(ControlRequest::CancelTimer { correlation_id }));
                }
                ServiceAction::CloseSession { session_id } => {
                    effects.push(Effect::Control(ControlRequest::CloseSession { session_id }));
                }
            }
        }

        StepResult::Applied {
            position,
            effects: std::mem::take(effects),
        }
    }

    fn push_response(
        &mut self,
        position: u64,
        session_id: SessionId,
        correlation_id: u64,
        timestamp: ClusterTime,
        payload: Vec<u8>,
        effects: &mut Vec<Effect>,
    ) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.digest);
        hasher.update(&position.to_le_bytes());
        hasher.update(&session_id.to_le_bytes());
        hasher.update(&correlation_id.to_le_bytes());
        hasher.update(&payload);
        self.digest.copy_from_slice(&hasher.finalize().as_bytes()[..16]);

        effects.push(Effect::Response {
            session_id,
            correlation_id,
            timestamp,
            payload,
        });
    }
}
