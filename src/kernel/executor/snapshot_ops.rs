use tracing::info;

use crate::kernel::snapshot::{SnapshotImage, SnapshotManifest};
use crate::kernel::traits::ClusteredService;

use super::error::{ExecutorStatus, FatalError};
use super::Executor;

impl<S: ClusteredService> Executor<S> {
    /// Check if a snapshot should be taken based on entry count threshold.
    ///
    /// Returns true if:
    /// - The threshold is non-zero
    /// - At least one entry has been applied
    /// - Entries since last snapshot >= snapshot_threshold
    pub fn should_snapshot(&self) -> bool {
        if self.snapshot_threshold == 0 || self.status == ExecutorStatus::Halted {
            return false;
        }
        let Some(last_applied) = self.last_applied_position() else {
            return false;
        };
        let entries_since_snapshot = match self.last_snapshot_position {
            Some(position) => last_applied.saturating_sub(position),
            None => last_applied,
        };
        entries_since_snapshot >= self.snapshot_threshold
    }

    /// Position of the most recently applied entry, None before the first.
    pub fn last_applied_position(&self) -> Option<u64> {
        if self.next_position <= 1 {
            None
        } else {
            Some(self.next_position - 1)
        }
    }

    /// Take a snapshot of the current state.
    ///
    /// # Semantics
    ///
    /// 1. snapshot position = last applied position
    /// 2. Serialize service state via service.snapshot()
    /// 3. Bundle it with the session registry and leadership term
    /// 4. Hand the manifest to the recorder
    /// 5. Update last_snapshot_position
    ///
    /// Never interleaved with apply: the executor is single-threaded.
    /// A recorder failure is returned but does not halt.
    pub fn take_snapshot(&mut self) -> Result<u64, FatalError> {
        if self.status == ExecutorStatus::Halted {
            return Err(FatalError::Halted);
        }

        let position = self.last_applied_position().ok_or_else(|| {
            FatalError::SnapshotError("cannot take snapshot: no entries applied yet".to_string())
        })?;

        let stream = self.guarded(position, |service, state| service.snapshot(state))?;

        let image = SnapshotImage {
            sessions: self.sessions.clone(),
            leadership_term: self.leadership_term,
            leader_member_id: self.leader_member_id,
            service_schema_version: stream.schema_version,
            service_state: stream.data,
        };
        let bytes = image
            .encode()
            .map_err(|e| FatalError::SnapshotError(e.to_string()))?;

        let manifest = SnapshotManifest::new(position, self.leadership_term, self.digest, bytes);
        self.recorder
            .record(&manifest)
            .map_err(|e| FatalError::SnapshotError(format!("failed to record snapshot: {}", e)))?;

        self.last_snapshot_position = Some(position);
        info!(
            member_id = self.member_id,
            position,
            sessions = self.sessions.len(),
            "snapshot taken"
        );
        Ok(position)
    }

    /// Get the last snapshot position.
    pub fn last_snapshot_position(&self) -> Option<u64> {
        self.last_snapshot_position
    }

    /// Set the snapshot threshold (entries between snapshots). Zero disables.
    pub fn set_snapshot_threshold(&mut self, threshold: u64) {
        self.snapshot_threshold = threshold;
    }
}
