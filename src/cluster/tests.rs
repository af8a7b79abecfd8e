//! Cluster integration tests.
//!
//! Three echo nodes on an in-memory network, ordered by the in-process
//! sequencer, with snapshots held in shared memory recorders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tempfile::TempDir;

use crate::codec::{AsciiText, Payload, PayloadKind};
use crate::config::{ClientConfig, NodeConfig};
use crate::kernel::echo::{EchoError, EchoService, EchoState};
use crate::kernel::executor::{FatalError, TerminationHook};
use crate::kernel::snapshot::MemoryRecorder;
use crate::kernel::traits::{
    ApplyContext, ClientSession, CloseReason, ClusteredService, Role, ServiceAction, SessionMessage, SnapshotStream,
    Transition,
};

use super::client::{ChannelListener, ClientError, ClusterClient, ReceivedResponse};
use super::liveness::{random_long_payloads, random_longs, LivenessMonitor};
use super::membership::{format_ingress_endpoints, PortScheme};
use super::message::LogBody;
use super::network::InMemoryNetwork;
use super::node::{spawn_node, NodeHandle, NodeState, NodeSubstrate};
use super::sequencer::{Sequencer, SequencerConfig, SequencerHandle};

const NODES: u32 = 3;
const WAIT: Duration = Duration::from_secs(5);

/// Echo service with two trigger values: 666 panics, 777 is echoed and also
/// schedules timer 7 at the message's own timestamp.
struct ScriptedEcho(EchoService);

const POISON: i64 = 666;
const SCHEDULES_TIMER: i64 = 777;
const TIMER_ID: u64 = 7;

impl ClusteredService for ScriptedEcho {
    type State = EchoState;
    type Error = EchoError;

    fn genesis(&self) -> EchoState {
        self.0.genesis()
    }

    fn on_start(&self, state: &EchoState, snapshot_position: Option<u64>) {
        self.0.on_start(state, snapshot_position)
    }

    fn on_session_open(
        &self,
        state: &EchoState,
        session: &ClientSession,
        ctx: &ApplyContext,
    ) -> Result<Transition<EchoState>, EchoError> {
        self.0.on_session_open(state, session, ctx)
    }

    fn on_session_message(
        &self,
        state: &EchoState,
        message: SessionMessage,
        ctx: &ApplyContext,
    ) -> Result<Transition<EchoState>, EchoError> {
        match i64::decode(&message.payload).ok() {
            Some(POISON) => panic!("poison payload"),
            Some(SCHEDULES_TIMER) => {
                let (state, mut actions) = self.0.on_session_message(state, message, ctx)?;
                actions.push(ServiceAction::ScheduleTimer {
                    correlation_id: TIMER_ID,
                    deadline: ctx.timestamp(),
                });
                Ok((state, actions))
            }
            _ => self.0.on_session_message(state, message, ctx),
        }
    }

    fn on_session_close(
        &self,
        state: &EchoState,
        session: &ClientSession,
        reason: CloseReason,
        ctx: &ApplyContext,
    ) -> Result<Transition<EchoState>, EchoError> {
        self.0.on_session_close(state, session, reason, ctx)
    }

    fn on_timer_event(
        &self,
        state: &EchoState,
        correlation_id: u64,
        ctx: &ApplyContext,
    ) -> Result<Transition<EchoState>, EchoError> {
        self.0.on_timer_event(state, correlation_id, ctx)
    }

    fn on_role_change(&self, role: Role) {
        self.0.on_role_change(role)
    }

    fn snapshot(&self, state: &EchoState) -> SnapshotStream {
        self.0.snapshot(state)
    }

    fn restore(&self, stream: SnapshotStream) -> Result<EchoState, EchoError> {
        self.0.restore(stream)
    }

    fn on_terminate(&self, state: &EchoState) {
        self.0.on_terminate(state)
    }
}

/// Three nodes plus their sequencer. Nodes are stopped before the sequencer.
struct TestCluster {
    nodes: Vec<Option<NodeHandle>>,
    recorders: Vec<MemoryRecorder>,
    configs: Vec<NodeConfig>,
    network: InMemoryNetwork,
    sequencer: Sequencer,
    _data: TempDir,
}

impl TestCluster {
    fn start(kind: PayloadKind, sequencer_config: SequencerConfig) -> Self {
        Self::start_with(kind, sequencer_config, EchoService::from_config, |_| None)
    }

    fn start_with<S: ClusteredService>(
        kind: PayloadKind,
        sequencer_config: SequencerConfig,
        service: impl Fn(&NodeConfig) -> S,
        hook: impl Fn(u32) -> Option<TerminationHook>,
    ) -> Self {
        let data = TempDir::new().unwrap();
        let hosts = vec!["localhost"; NODES as usize];
        let configs: Vec<NodeConfig> = (0..NODES)
            .map(|id| {
                let mut config = NodeConfig::for_member(id, &hosts, &PortScheme::default(), data.path()).unwrap();
                config.payload_kind = kind;
                config
            })
            .collect();

        let network = InMemoryNetwork::new();
        let sequencer = Sequencer::start(sequencer_config, &configs[0].membership, Arc::new(network.clone())).unwrap();

        let mut cluster = TestCluster {
            nodes: Vec::new(),
            recorders: (0..NODES).map(|_| MemoryRecorder::new()).collect(),
            configs,
            network,
            sequencer,
            _data: data,
        };
        for id in 0..NODES {
            let node = cluster.spawn(id, service(&cluster.configs[id as usize]), hook(id));
            cluster.nodes.push(Some(node));
        }
        cluster
    }

    fn spawn<S: ClusteredService>(&self, id: u32, service: S, hook: Option<TerminationHook>) -> NodeHandle {
        let substrate = NodeSubstrate {
            transport: Arc::new(self.network.clone()),
            log: Arc::new(self.log()),
            recorder: Box::new(self.recorders[id as usize].clone()),
        };
        spawn_node(self.configs[id as usize].clone(), service, substrate, hook).unwrap()
    }

    fn log(&self) -> SequencerHandle {
        self.sequencer.handle()
    }

    fn node(&self, id: u32) -> &NodeHandle {
        self.nodes[id as usize].as_ref().unwrap()
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            ingress_endpoints: format_ingress_endpoints(&self.configs[0].membership),
            ..ClientConfig::default()
        }
    }

    fn client(&self, config: ClientConfig) -> (ClusterClient<ChannelListener>, Receiver<ReceivedResponse>) {
        let (listener, responses) = ChannelListener::new();
        let client = ClusterClient::connect(config, Arc::new(self.network.clone()), listener).unwrap();
        (client, responses)
    }

    /// Wait until every running node has applied the whole log.
    fn converge(&self) -> Vec<NodeState> {
        let deadline = Instant::now() + WAIT;
        loop {
            let target = self.log().last_position() + 1;
            let states: Vec<NodeState> = self
                .nodes
                .iter()
                .flatten()
                .map(|node| node.get_state().unwrap())
                .collect();
            if states.iter().all(|s| s.next_position == target) {
                return states;
            }
            assert!(Instant::now() < deadline, "nodes did not converge: {:?}", states);
            thread::sleep(Duration::from_millis(2));
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.nodes.clear();
        self.sequencer.stop();
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(1));
    }
}

fn assert_same_digest(states: &[NodeState]) {
    for state in &states[1..] {
        assert_eq!(state.digest, states[0].digest, "member {} diverged", state.member_id);
    }
}

/// Test: test_text_message_echoed_exactly_once
///
/// 1. Start a 3-node text echo cluster
/// 2. Submit "Hello World ! (1)"
/// 3. Verify: exactly one response, byte-identical to the submission
/// 4. Verify: every node holds the session and the same state digest
#[test]
fn test_text_message_echoed_exactly_once() {
    let cluster = TestCluster::start(PayloadKind::Text, SequencerConfig::default());
    let (mut client, responses) = cluster.client(cluster.client_config());
    assert_eq!(client.session_id(), 1);
    assert_eq!(client.leader_member_id(), 0);

    let correlation_id = client.submit_text("Hello World ! (1)").unwrap();
    client.await_response(correlation_id, WAIT).unwrap();

    let response = responses.recv_timeout(WAIT).unwrap();
    assert_eq!(response.correlation_id, correlation_id);
    assert_eq!(response.session_id, client.session_id());
    assert_eq!(response.payload, AsciiText::new("Hello World ! (1)").unwrap().encode());

    thread::sleep(Duration::from_millis(50));
    client.poll_responses();
    assert!(responses.try_recv().is_err());

    let states = cluster.converge();
    assert_same_digest(&states);
    for state in &states {
        assert_eq!(state.open_sessions, vec![client.session_id()]);
        let expected = if state.member_id == 0 { Role::Leader } else { Role::Follower };
        assert_eq!(state.role, expected);
    }
}

/// Test: test_seeded_integers_arrive_in_order
///
/// 1. Drive ten seeded integers through the liveness monitor
/// 2. Verify: ten responses, in submission order, values unchanged
/// 3. Verify: all nodes converge on the same digest
#[test]
fn test_seeded_integers_arrive_in_order() {
    let cluster = TestCluster::start(PayloadKind::Integer, SequencerConfig::default());
    let mut config = cluster.client_config();
    config.message_interval_ms = 1;
    let (mut client, responses) = cluster.client(config);

    let sent = LivenessMonitor::new(&mut client, random_long_payloads(100, 10)).run().unwrap();
    assert_eq!(sent, 10);

    let received: Vec<ReceivedResponse> = responses.try_iter().collect();
    assert_eq!(received.len(), 10);
    assert!(received.windows(2).all(|w| w[0].correlation_id < w[1].correlation_id));
    assert!(received.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    let values: Vec<i64> = received.iter().map(|r| i64::decode(&r.payload).unwrap()).collect();
    assert_eq!(values, random_longs(100, 10));

    assert_same_digest(&cluster.converge());
}

/// Test: test_malformed_payload_rejected_session_survives
///
/// 1. Submit a payload that is not an 8-byte integer
/// 2. Verify: the client sees a rejection, not a response
/// 3. Verify: the session still echoes well-formed integers
#[test]
fn test_malformed_payload_rejected_session_survives() {
    let cluster = TestCluster::start(PayloadKind::Integer, SequencerConfig::default());
    let (mut client, responses) = cluster.client(cluster.client_config());

    let bad = client.submit(b"abc").unwrap();
    assert!(matches!(
        client.await_response(bad, WAIT),
        Err(ClientError::Rejected { correlation_id, .. }) if correlation_id == bad
    ));
    assert!(responses.try_recv().is_err());

    let good = client.submit_integer(-7).unwrap();
    client.await_response(good, WAIT).unwrap();
    let response = responses.recv_timeout(WAIT).unwrap();
    assert_eq!(i64::decode(&response.payload).unwrap(), -7);
    assert!(!client.is_closed());
}

/// Test: test_follower_restarts_from_snapshot
///
/// 1. Echo five messages, snapshot member 2, stop it
/// 2. Echo three more while it is down
/// 3. Restart member 2 from its recorder
/// 4. Verify: it resumes from the snapshot and catches up to the same digest
#[test]
fn test_follower_restarts_from_snapshot() {
    let mut cluster = TestCluster::start(PayloadKind::Integer, SequencerConfig::default());
    let (mut client, responses) = cluster.client(cluster.client_config());

    for value in 0..5 {
        let id = client.submit_integer(value).unwrap();
        client.await_response(id, WAIT).unwrap();
    }
    cluster.converge();
    let snapshot_position = cluster.node(2).take_snapshot().unwrap();
    assert_eq!(snapshot_position, cluster.log().last_position());
    assert_eq!(cluster.recorders[2].len(), 1);

    cluster.nodes[2] = None;
    for value in 5..8 {
        let id = client.submit_integer(value).unwrap();
        client.await_response(id, WAIT).unwrap();
    }

    let restarted = cluster.spawn(2, EchoService::from_config(&cluster.configs[2]), None);
    cluster.nodes[2] = Some(restarted);

    let states = cluster.converge();
    assert_same_digest(&states);
    assert_eq!(states[2].last_snapshot_position, Some(snapshot_position));
    assert_eq!(states[2].open_sessions, vec![client.session_id()]);
    assert_eq!(responses.try_iter().count(), 8);
}

/// Test: test_client_follows_new_leader
///
/// 1. Connect through member 0
/// 2. Elect member 1
/// 3. Verify: the client switches ingress to member 1 and keeps echoing
#[test]
fn test_client_follows_new_leader() {
    let cluster = TestCluster::start(PayloadKind::Integer, SequencerConfig::default());
    let (mut client, responses) = cluster.client(cluster.client_config());
    let first = client.submit_integer(1).unwrap();
    client.await_response(first, WAIT).unwrap();

    cluster.log().elect(1);
    wait_until(|| {
        client.poll_responses();
        client.leader_member_id() == 1
    });
    assert_eq!(client.leadership_term(), 2);

    let second = client.submit_integer(2).unwrap();
    client.await_response(second, WAIT).unwrap();
    let values: Vec<i64> = responses.try_iter().map(|r| i64::decode(&r.payload).unwrap()).collect();
    assert_eq!(values, vec![1, 2]);

    let states = cluster.converge();
    assert_same_digest(&states);
    assert_eq!(states[0].role, Role::Follower);
    assert_eq!(states[1].role, Role::Leader);
    assert!(states.iter().all(|s| s.leadership_term == 2));
}

/// Test: test_message_in_flight_across_leader_change_is_answered
///
/// 1. Echo one message through member 0
/// 2. Elect member 1 and submit before the client hears of it
/// 3. Verify: member 0 redirects the message and the client resubmits it
/// 4. Verify: both values are echoed once and the client now uses member 1
#[test]
fn test_message_in_flight_across_leader_change_is_answered() {
    let cluster = TestCluster::start(PayloadKind::Integer, SequencerConfig::default());
    let (mut client, responses) = cluster.client(cluster.client_config());
    let first = client.submit_integer(1).unwrap();
    client.await_response(first, WAIT).unwrap();

    cluster.log().elect(1);
    let second = client.submit_integer(2).unwrap();
    client.await_response(second, WAIT).unwrap();

    let values: Vec<i64> = responses.try_iter().map(|r| i64::decode(&r.payload).unwrap()).collect();
    assert_eq!(values, vec![1, 2]);
    assert_eq!(client.leader_member_id(), 1);
    assert_eq!(client.outstanding(), 0);
    assert_same_digest(&cluster.converge());
}

/// Test: test_connect_to_follower_is_redirected
///
/// 1. Elect member 2 before any client connects
/// 2. Connect; member 0 is tried first and redirects
/// 3. Verify: the session is established through member 2
#[test]
fn test_connect_to_follower_is_redirected() {
    let cluster = TestCluster::start(PayloadKind::Integer, SequencerConfig::default());
    cluster.log().elect(2);
    cluster.converge();

    let (mut client, responses) = cluster.client(cluster.client_config());
    assert_eq!(client.leader_member_id(), 2);
    assert_eq!(client.leadership_term(), 2);
    let id = client.submit_integer(9).unwrap();
    client.await_response(id, WAIT).unwrap();
    assert_eq!(i64::decode(&responses.recv_timeout(WAIT).unwrap().payload).unwrap(), 9);
}

/// Test: test_idle_session_times_out
///
/// A session with no traffic is closed by the cluster and removed from
/// every node.
#[test]
fn test_idle_session_times_out() {
    let sequencer_config = SequencerConfig {
        session_timeout: Duration::from_millis(100),
        ..SequencerConfig::default()
    };
    let cluster = TestCluster::start(PayloadKind::Integer, sequencer_config);
    let mut config = cluster.client_config();
    config.keep_alive_interval_ms = 60_000;
    let (mut client, _responses) = cluster.client(config);

    wait_until(|| {
        client.poll_responses();
        client.is_closed()
    });
    assert!(matches!(client.submit_integer(1), Err(ClientError::SessionClosed { .. })));

    let states = cluster.converge();
    assert!(states.iter().all(|s| s.open_sessions.is_empty()));
}

/// Test: test_keep_alive_holds_session_open
///
/// Keep-alives alone keep a session past several timeout periods.
#[test]
fn test_keep_alive_holds_session_open() {
    let sequencer_config = SequencerConfig {
        session_timeout: Duration::from_millis(200),
        ..SequencerConfig::default()
    };
    let cluster = TestCluster::start(PayloadKind::Integer, sequencer_config);
    let mut config = cluster.client_config();
    config.keep_alive_interval_ms = 20;
    let (mut client, _responses) = cluster.client(config);

    let until = Instant::now() + Duration::from_millis(600);
    while Instant::now() < until {
        client.keep_alive_if_due(Instant::now()).unwrap();
        client.poll_responses();
        thread::sleep(Duration::from_millis(2));
    }
    assert!(!client.is_closed());
    let id = client.submit_integer(5).unwrap();
    client.await_response(id, WAIT).unwrap();
}

/// Test: test_poison_message_halts_every_node
///
/// 1. Every node runs a service that panics on 666
/// 2. Submit 666
/// 3. Verify: each node halts and its termination hook fires exactly once
#[test]
fn test_poison_message_halts_every_node() {
    let fired = Arc::new(AtomicUsize::new(0));
    let hook_count = fired.clone();
    let cluster = TestCluster::start_with(
        PayloadKind::Integer,
        SequencerConfig::default(),
        |config| ScriptedEcho(EchoService::from_config(config)),
        move |_| {
            let fired = hook_count.clone();
            Some(Box::new(move |_: &FatalError| {
                fired.fetch_add(1, Ordering::SeqCst);
            }) as TerminationHook)
        },
    );
    let (mut client, responses) = cluster.client(cluster.client_config());

    let id = client.submit_integer(POISON).unwrap();
    wait_until(|| (0..NODES).all(|n| cluster.node(n).is_halted()));
    assert!(matches!(
        client.await_response(id, Duration::from_millis(100)),
        Err(ClientError::ResponseTimeout { .. })
    ));
    assert!(responses.try_recv().is_err());

    for n in 0..NODES {
        let state = cluster.node(n).get_state().unwrap();
        assert!(state.halted);
        assert!(state.next_position <= cluster.log().last_position());
    }

    // Later entries are never applied and the hook does not fire again.
    let _ = client.submit_integer(1);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), NODES as usize);
}

/// Test: test_restarted_leader_does_not_reschedule_timers
///
/// 1. Snapshot the leader, then echo 777 so it schedules timer 7
/// 2. Wait for the timer to be committed
/// 3. Restart the leader from its snapshot; it replays the scheduling message
/// 4. Verify: the timer is committed exactly once and the node is still leader
#[test]
fn test_restarted_leader_does_not_reschedule_timers() {
    let mut cluster = TestCluster::start_with(
        PayloadKind::Integer,
        SequencerConfig::default(),
        |config| ScriptedEcho(EchoService::from_config(config)),
        |_| None,
    );
    let (mut client, _responses) = cluster.client(cluster.client_config());
    cluster.converge();
    cluster.node(0).take_snapshot().unwrap();

    let id = client.submit_integer(SCHEDULES_TIMER).unwrap();
    client.await_response(id, WAIT).unwrap();
    let timers = |log: &SequencerHandle| {
        log.entries()
            .iter()
            .filter(|e| e.body == LogBody::Timer { correlation_id: TIMER_ID })
            .count()
    };
    wait_until(|| timers(&cluster.log()) == 1);

    cluster.nodes[0] = None;
    let restarted = cluster.spawn(0, ScriptedEcho(EchoService::from_config(&cluster.configs[0])), None);
    cluster.nodes[0] = Some(restarted);

    let states = cluster.converge();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(timers(&cluster.log()), 1);
    assert_eq!(states[0].role, Role::Leader);
    assert_same_digest(&cluster.converge());
}
