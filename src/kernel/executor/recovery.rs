//! Executor recovery from a recorded snapshot.
//!
//! # Recovery Invariants
//!
//! 1. **The snapshot defines where replay starts.**
//!    Entries at or below the snapshot position are skipped as duplicates.
//!
//! 2. **Restore happens before any apply.**
//!    Sessions, leadership and service state all come from one image.
//!
//! 3. **Invalid images are skipped, not trusted.**
//!    The recorder falls back to older images; a valid image that the service
//!    cannot restore is fatal.

use std::panic::{self, AssertUnwindSafe};

use tracing::info;

use crate::kernel::snapshot::{Recorder, SnapshotImage};
use crate::kernel::traits::{ClusteredService, SnapshotStream};

use super::error::FatalError;
use super::{BaseState, Executor};

impl<S: ClusteredService> Executor<S> {
    /// Recover from the recorder's latest valid snapshot, or start at genesis.
    ///
    /// Resume by feeding entries from `next_position()`; earlier entries are
    /// accepted and skipped.
    pub fn recover(service: S, member_id: u32, recorder: Box<dyn Recorder>) -> Result<Self, FatalError> {
        let latest = recorder
            .latest()
            .map_err(|e| FatalError::SnapshotError(format!("failed to read snapshots: {}", e)))?;

        let Some(manifest) = latest else {
            info!(member_id, "no snapshot found, starting from genesis");
            return Ok(Self::new(service, member_id, recorder));
        };

        let image = SnapshotImage::decode(&manifest.image).map_err(|e| {
            FatalError::RestoreError(format!("snapshot at {} has a corrupt image: {}", manifest.position, e))
        })?;

        let stream = SnapshotStream {
            schema_version: image.service_schema_version,
            data: image.service_state,
        };
        let restored = panic::catch_unwind(AssertUnwindSafe(|| service.restore(stream))).map_err(|_| {
            FatalError::PoisonPill {
                position: manifest.position,
                message: "service panicked during restore".to_string(),
            }
        })?;
        let state = restored.map_err(|e| FatalError::RestoreError(format!("failed to restore state: {}", e)))?;

        info!(
            member_id,
            position = manifest.position,
            leadership_term = image.leadership_term,
            sessions = image.sessions.len(),
            "restored from snapshot"
        );

        let base = BaseState {
            state,
            sessions: image.sessions,
            leadership_term: image.leadership_term,
            leader_member_id: image.leader_member_id,
            snapshot_position: Some(manifest.position),
            digest: manifest.digest,
        };
        Ok(Self::start(service, member_id, recorder, base))
    }
}
