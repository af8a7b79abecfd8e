//! Messaging and log substrate seams.
//!
//! Everything the cluster needs from its transport is expressed as a small
//! trait here: non-blocking publications, polled subscriptions, an endpoint
//! registry, a committed-log subscription and a control channel back to the
//! log. [`InMemoryNetwork`](super::network::InMemoryNetwork) and the
//! [`Sequencer`](super::sequencer::Sequencer) implement them in-process.

use thiserror::Error;

use super::message::{ControlRequest, LogEntry};

/// Result of a single non-blocking offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The buffer was accepted by the destination.
    Accepted,
    /// The destination is full; retry later.
    BackPressured,
    /// The destination is temporarily unreachable; retry later.
    NotConnected,
    /// The destination is gone; retrying cannot succeed.
    Closed,
}

/// Sending side of a unidirectional stream.
pub trait Publication {
    /// Try to hand `buffer` to the destination without blocking.
    fn offer(&mut self, buffer: &[u8]) -> OfferOutcome;
}

impl<P: Publication + ?Sized> Publication for Box<P> {
    fn offer(&mut self, buffer: &[u8]) -> OfferOutcome {
        (**self).offer(buffer)
    }
}

/// Receiving side of a unidirectional stream.
pub trait Subscription {
    /// Deliver up to `limit` buffers to `handler`. Returns how many were delivered.
    fn poll(&mut self, handler: &mut dyn FnMut(&[u8]), limit: usize) -> usize;

    /// Endpoint this subscription is bound to.
    fn endpoint(&self) -> &str;
}

/// Transport failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no subscription bound at {0}")]
    UnknownEndpoint(String),

    #[error("endpoint {0} is already bound")]
    EndpointInUse(String),

    #[error("malformed endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("{endpoint} is closed")]
    Closed { endpoint: String },
}

/// Endpoint registry: bind subscriptions, connect publications.
pub trait Transport: Send + Sync {
    /// Open a publication to the subscription bound at `endpoint`.
    fn connect(&self, endpoint: &str) -> Result<Box<dyn Publication + Send>, TransportError>;

    /// Bind a subscription holding at most `capacity` undelivered buffers.
    ///
    /// An endpoint with port `0` is assigned a free port; read it back from
    /// [`Subscription::endpoint`].
    fn bind(&self, endpoint: &str, capacity: usize) -> Result<Box<dyn Subscription + Send>, TransportError>;
}

/// Ordered stream of committed log entries for one node.
pub trait LogSubscription: Send {
    /// Deliver up to `limit` committed entries in position order.
    ///
    /// An error means the log is no longer reachable.
    fn poll(&mut self, handler: &mut dyn FnMut(LogEntry), limit: usize) -> Result<usize, TransportError>;
}

/// Requests from a node's service back to the log.
pub trait LogControl: Send {
    fn request(&self, request: ControlRequest) -> Result<(), TransportError>;
}

/// The ordered log service shared by every node.
pub trait OrderedLog: Send + Sync {
    /// Subscribe to committed entries starting at `from_position`.
    fn subscribe(&self, from_position: u64) -> Result<Box<dyn LogSubscription>, TransportError>;

    /// Control channel for requests originating at `member_id`.
    fn control(&self, member_id: u32) -> Box<dyn LogControl>;

    /// Position of the last committed entry, 0 when empty.
    fn committed_position(&self) -> u64;
}
