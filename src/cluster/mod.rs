//! Cluster layer: everything between the deterministic kernel and the outside.
//!
//! - [`substrate`]: transport, ordered-log and control traits
//! - [`network`] and [`sequencer`]: in-process implementations of them
//! - [`membership`]: endpoint derivation and descriptors
//! - [`node`]: the per-node thread that applies committed entries
//! - [`client`] and [`liveness`]: the client session facade and its driver
//!
//! # Invariants
//!
//! 1. **Single Order**: every node applies the same committed entries in the same position order.
//! 2. **Leader Egress**: only the current leader transmits to client sessions.
//! 3. **Exactly Once**: a client hands each correlation id's response to its listener at most once.

pub mod client;
pub mod liveness;
pub mod membership;
pub mod message;
pub mod network;
pub mod node;
pub mod sequencer;
pub mod substrate;

#[cfg(test)]
mod tests;

pub use client::{ChannelListener, ClientError, ClusterClient, EgressListener, ReceivedResponse};
pub use liveness::{random_long_payloads, random_longs, LivenessMonitor, Tick};
pub use membership::{ClusterMember, MembershipError, PortRole, PortScheme};
pub use message::{ControlRequest, EgressMessage, EventCode, IngressMessage, LogBody, LogEntry};
pub use network::InMemoryNetwork;
pub use node::{spawn_node, NodeCommand, NodeHandle, NodeState, NodeSubstrate};
pub use sequencer::{Sequencer, SequencerConfig, SequencerHandle};
pub use substrate::{
    LogControl, LogSubscription, OfferOutcome, OrderedLog, Publication, Subscription, Transport, TransportError,
};
