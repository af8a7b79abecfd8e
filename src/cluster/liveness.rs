//! Client-side liveness monitor.
//!
//! Drives a client between application messages: sends queued payloads at
//! the message interval, emits keep-alives when the session would otherwise
//! go quiet, and polls egress on every tick so responses are never starved
//! while a deadline is pending.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::codec::Payload;

use super::client::{ClientError, ClusterClient, EgressListener};

/// What one tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// Sent the next queued payload under this correlation id.
    Sent(u64),
    KeepAlive,
    /// Nothing was due.
    Idle,
    /// Every payload was sent and answered, or the monitor was cancelled.
    Finished,
}

pub struct LivenessMonitor<'a, L: EgressListener> {
    client: &'a mut ClusterClient<L>,
    pending: VecDeque<Vec<u8>>,
    message_interval: Duration,
    keep_alive_interval: Duration,
    next_message_at: Instant,
    next_keep_alive_at: Instant,
    cancelled: Arc<AtomicBool>,
    last_work: usize,
}

impl<'a, L: EgressListener> LivenessMonitor<'a, L> {
    /// Monitor `client`, sending `payloads` in order. The first payload is due
    /// immediately.
    pub fn new(client: &'a mut ClusterClient<L>, payloads: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let now = Instant::now();
        let message_interval = client.config().message_interval();
        let keep_alive_interval = client.config().keep_alive_interval();
        LivenessMonitor {
            client,
            pending: payloads.into_iter().collect(),
            message_interval,
            keep_alive_interval,
            next_message_at: now,
            next_keep_alive_at: now + keep_alive_interval,
            cancelled: Arc::new(AtomicBool::new(false)),
            last_work: 0,
        }
    }

    /// Flag that stops the monitor at its next tick.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Payloads not yet sent.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Advance the monitor once at time `now`.
    ///
    /// Egress is polled first on every tick. A rejected message, or a
    /// response that stays unanswered past the client's response timeout,
    /// fails the monitor.
    pub fn tick(&mut self, now: Instant) -> Result<Tick, ClientError> {
        self.last_work = self.client.poll_responses();
        if let Some((correlation_id, detail)) = self.client.take_rejection() {
            while let Some((other, reason)) = self.client.take_rejection() {
                warn!(correlation_id = other, %reason, "further rejection dropped");
            }
            return Err(ClientError::Rejected { correlation_id, detail });
        }

        if self.cancelled.load(Ordering::SeqCst) {
            debug!(remaining = self.pending.len(), "liveness monitor cancelled");
            return Ok(Tick::Finished);
        }
        if let Some(correlation_id) = self.client.overdue(now) {
            return Err(ClientError::ResponseTimeout { correlation_id });
        }

        if now >= self.next_message_at {
            if let Some(payload) = self.pending.pop_front() {
                let correlation_id = self.client.submit(&payload)?;
                self.next_message_at = now + self.message_interval;
                self.next_keep_alive_at = now + self.keep_alive_interval;
                self.last_work += 1;
                return Ok(Tick::Sent(correlation_id));
            }
        }

        if self.pending.is_empty() && self.client.outstanding() == 0 {
            return Ok(Tick::Finished);
        }

        if now >= self.next_keep_alive_at {
            self.client.keep_alive()?;
            self.next_keep_alive_at = now + self.keep_alive_interval;
            self.last_work += 1;
            trace!(session_id = self.client.session_id(), "keep-alive sent");
            return Ok(Tick::KeepAlive);
        }
        Ok(Tick::Idle)
    }

    /// Tick until finished. Returns the number of payloads sent.
    pub fn run(&mut self) -> Result<usize, ClientError> {
        let mut sent = 0;
        loop {
            match self.tick(Instant::now())? {
                Tick::Finished => return Ok(sent),
                Tick::Sent(_) => sent += 1,
                Tick::KeepAlive | Tick::Idle => {}
            }
            self.client.idle(self.last_work);
        }
    }
}

/// `count` integers from a generator seeded with `seed`.
pub fn random_longs(seed: u64, count: usize) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| rng.gen::<i64>()).collect()
}

/// [`random_longs`], encoded as integer payloads.
pub fn random_long_payloads(seed: u64, count: usize) -> Vec<Vec<u8>> {
    random_longs(seed, count).into_iter().map(|v| v.encode()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::client::ChannelListener;
    use crate::cluster::message::{EgressMessage, EventCode, IngressMessage};
    use crate::cluster::network::InMemoryNetwork;
    use crate::cluster::substrate::{Publication, Subscription, Transport};
    use crate::config::ClientConfig;
    use std::thread;

    #[test]
    fn test_seeded_values_are_reproducible() {
        assert_eq!(random_longs(100, 10), random_longs(100, 10));
        assert_ne!(random_longs(100, 10), random_longs(101, 10));
        let payloads = random_long_payloads(100, 10);
        assert_eq!(payloads.len(), 10);
        assert!(payloads.iter().all(|p| p.len() == 8));
    }

    /// Answers the connect, then records every ingress message until `stop`
    /// is set. Rejects the payload `[0xFF]` and never answers any other
    /// application message.
    fn silent_leader(
        network: InMemoryNetwork,
        stop: Arc<AtomicBool>,
    ) -> thread::JoinHandle<Vec<IngressMessage>> {
        let mut ingress = network.bind("localhost:9002", 64).unwrap();
        let event = |correlation_id, code| {
            EgressMessage::SessionEvent {
                session_id: 3,
                correlation_id,
                leadership_term: 1,
                leader_member_id: 0,
                code,
                detail: String::new(),
            }
            .serialize()
        };
        thread::spawn(move || {
            let mut egress: Option<Box<dyn Publication + Send>> = None;
            let mut seen = Vec::new();
            loop {
                let stopping = stop.load(Ordering::SeqCst);
                let mut received = Vec::new();
                ingress.poll(&mut |b| received.push(IngressMessage::deserialize(b).unwrap()), 16);
                for message in received {
                    match &message {
                        IngressMessage::Connect {
                            correlation_id,
                            response_endpoint,
                        } => {
                            let publication = network.connect(response_endpoint).unwrap();
                            let egress = egress.insert(publication);
                            egress.offer(&event(*correlation_id, EventCode::Ok));
                        }
                        IngressMessage::SessionMessage {
                            correlation_id, payload, ..
                        } if payload.as_slice() == [0xFF] => {
                            if let Some(egress) = egress.as_mut() {
                                egress.offer(&event(*correlation_id, EventCode::Error));
                            }
                        }
                        _ => {}
                    }
                    seen.push(message);
                }
                if stopping {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            seen
        })
    }

    #[test]
    fn test_keep_alive_when_quiet_then_timeout() {
        let network = InMemoryNetwork::new();
        let stop = Arc::new(AtomicBool::new(false));
        let leader = silent_leader(network.clone(), stop.clone());

        let config = ClientConfig {
            ingress_endpoints: "0=localhost:9002".to_string(),
            keep_alive_interval_ms: 5,
            message_interval_ms: 1,
            response_timeout_ms: 40,
            ..ClientConfig::default()
        };
        let (listener, _responses) = ChannelListener::new();
        let mut client = ClusterClient::connect(config, Arc::new(network), listener).unwrap();

        let mut monitor = LivenessMonitor::new(&mut client, random_long_payloads(100, 1));
        let start = Instant::now();
        assert!(matches!(monitor.tick(start), Ok(Tick::Sent(2))));
        assert!(matches!(monitor.tick(start), Ok(Tick::Idle)));
        assert!(matches!(monitor.tick(start + Duration::from_millis(6)), Ok(Tick::KeepAlive)));
        assert!(matches!(
            monitor.tick(start + Duration::from_secs(1)),
            Err(ClientError::ResponseTimeout { correlation_id: 2 })
        ));

        stop.store(true, Ordering::SeqCst);
        let seen = leader.join().unwrap();
        assert!(matches!(seen[1], IngressMessage::SessionMessage { correlation_id: 2, .. }));
        assert!(matches!(seen[2], IngressMessage::KeepAlive { session_id: 3 }));
    }

    #[test]
    fn test_rejection_fails_monitor_once() {
        let network = InMemoryNetwork::new();
        let stop = Arc::new(AtomicBool::new(false));
        let leader = silent_leader(network.clone(), stop.clone());
        let config = ClientConfig {
            ingress_endpoints: "0=localhost:9002".to_string(),
            message_interval_ms: 1,
            ..ClientConfig::default()
        };
        let (listener, _responses) = ChannelListener::new();
        let mut client = ClusterClient::connect(config, Arc::new(network), listener).unwrap();

        let mut monitor = LivenessMonitor::new(&mut client, vec![vec![0xFF]]);
        assert!(matches!(monitor.tick(Instant::now()), Ok(Tick::Sent(2))));
        let deadline = Instant::now() + Duration::from_secs(2);
        let failure = loop {
            match monitor.tick(Instant::now()) {
                Ok(_) => {
                    assert!(Instant::now() < deadline, "rejection not reported");
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => break e,
            }
        };
        assert!(matches!(failure, ClientError::Rejected { correlation_id: 2, .. }));
        assert!(client.take_rejection().is_none());
        assert_eq!(client.outstanding(), 0);

        stop.store(true, Ordering::SeqCst);
        leader.join().unwrap();
    }

    #[test]
    fn test_cancel_finishes() {
        let network = InMemoryNetwork::new();
        let stop = Arc::new(AtomicBool::new(false));
        let leader = silent_leader(network.clone(), stop.clone());
        let config = ClientConfig {
            ingress_endpoints: "0=localhost:9002".to_string(),
            ..ClientConfig::default()
        };
        let (listener, _responses) = ChannelListener::new();
        let mut client = ClusterClient::connect(config, Arc::new(network), listener).unwrap();

        let mut monitor = LivenessMonitor::new(&mut client, random_long_payloads(1, 5));
        monitor.cancel_handle().store(true, Ordering::SeqCst);
        assert_eq!(monitor.run().unwrap(), 0);
        assert_eq!(monitor.remaining(), 5);

        stop.store(true, Ordering::SeqCst);
        leader.join().unwrap();
    }
}
