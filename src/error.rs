//! Crate-level error taxonomy.
//!
//! Each layer has its own error enum; they all fold into [`Error`], whose
//! variants follow the four failure classes of the protocol plus configuration
//! and snapshot failures.

use thiserror::Error;

use crate::backpressure::GateError;
use crate::cluster::client::ClientError;
use crate::cluster::membership::MembershipError;
use crate::cluster::substrate::TransportError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::kernel::executor::FatalError;
use crate::kernel::snapshot::SnapshotError;

/// Errors surfaced by the clustered service.
#[derive(Debug, Error)]
pub enum Error {
    /// A payload could not be decoded. The message is rejected, never applied.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] CodecError),

    /// A bounded send could not complete before its deadline.
    #[error("send timed out after {attempts} attempts")]
    SendTimeout { attempts: u64 },

    /// The session is no longer open; the operation is discarded.
    #[error("session closed")]
    SessionClosed,

    /// The substrate failed; this node must stop participating.
    #[error("substrate fault: {0}")]
    SubstrateFault(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid cluster membership descriptor.
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    /// Snapshot could not be recorded or loaded.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Client-side failure that is not one of the classes above.
    #[error("client error: {0}")]
    Client(String),
}

impl Error {
    /// True when the node can no longer proceed without risking divergent state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::SubstrateFault(_))
    }
}

impl From<GateError> for Error {
    fn from(e: GateError) -> Self {
        match e {
            GateError::SendTimeout { attempts, .. } => Error::SendTimeout { attempts },
            GateError::SessionClosed => Error::SessionClosed,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed { .. } => Error::SessionClosed,
            other => Error::SubstrateFault(other.to_string()),
        }
    }
}

impl From<FatalError> for Error {
    fn from(e: FatalError) -> Self {
        Error::SubstrateFault(e.to_string())
    }
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Gate(gate) => gate.into(),
            ClientError::Codec(codec) => Error::MalformedPayload(codec),
            ClientError::SessionClosed { .. } => Error::SessionClosed,
            ClientError::Transport(transport) => transport.into(),
            other => Error::Client(other.to_string()),
        }
    }
}

/// Result alias for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;
