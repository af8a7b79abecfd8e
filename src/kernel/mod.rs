//! Kernel module: deterministic execution of a clustered service.
//!
//! The kernel sits on top of the ordered log and provides:
//! - The service interface and the types it sees
//! - In-order, panic-isolated application of committed entries
//! - Snapshot capture, recording and recovery
//! - Node-side session egress

pub mod echo;
pub mod executor;
pub mod session;
pub mod snapshot;
pub mod traits;

pub use echo::{EchoError, EchoService, EchoState, ECHO_SCHEMA_VERSION};
pub use executor::{Effect, Executor, ExecutorStatus, FatalError, StepResult, TerminationHook};
pub use session::{Delivery, SessionManager};
pub use snapshot::{
    FileRecorder, MemoryRecorder, Recorder, SnapshotError, SnapshotImage, SnapshotManifest, SNAPSHOT_HEADER_SIZE,
    SNAPSHOT_MAGIC, SNAPSHOT_VERSION,
};
pub use traits::{
    ApplyContext, ClientSession, CloseReason, ClusterTime, ClusteredService, Role, ServiceAction, SessionId,
    SessionMessage, SessionState, SnapshotStream, Transition,
};
