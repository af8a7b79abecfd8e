use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::traits::{ClientSession, SessionId};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Snapshot file magic bytes: "SNAP"
pub const SNAPSHOT_MAGIC: [u8; 4] = [0x53, 0x4E, 0x41, 0x50];

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Snapshot header size in bytes.
pub const SNAPSHOT_HEADER_SIZE: usize = 64;

// =============================================================================
// SNAPSHOT IMAGE
// =============================================================================

/// Everything a node needs to resume at a log position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotImage {
    /// Open sessions at the snapshot position.
    pub sessions: BTreeMap<SessionId, ClientSession>,
    pub leadership_term: u64,
    pub leader_member_id: Option<u32>,
    /// Schema version reported by the service's `snapshot()`.
    pub service_schema_version: u32,
    pub service_state: Vec<u8>,
}

impl SnapshotImage {
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serialize(self).map_err(|e| SnapshotError::Serialize(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        bincode::deserialize(bytes).map_err(|e| SnapshotError::Serialize(e.to_string()))
    }
}

// =============================================================================
// SNAPSHOT MANIFEST
// =============================================================================

/// The on-disk snapshot manifest.
///
/// # Layout (64 bytes header + variable image)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic ("SNAP")
/// 4       2     version
/// 6       2     flags
/// 8       8     position
/// 16      8     leadership_term
/// 24      16    digest
/// 40      8     image_size
/// 48      4     image_checksum (CRC32C)
/// 52      4     header_checksum (CRC32C of bytes 0..52)
/// 56      8     reserved (must be zero)
/// 64      var   image payload
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotManifest {
    /// Highest log position included in this snapshot.
    pub position: u64,

    /// Leadership term at `position`.
    pub leadership_term: u64,

    /// Response digest after applying `position`.
    pub digest: [u8; 16],

    /// Encoded [`SnapshotImage`].
    pub image: Vec<u8>,
}

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("header checksum mismatch: expected {expected}, got {actual}")]
    HeaderChecksumMismatch { expected: u32, actual: u32 },

    #[error("image checksum mismatch: expected {expected}, got {actual}")]
    ImageChecksumMismatch { expected: u32, actual: u32 },

    #[error("file too small for snapshot header")]
    FileTooSmall,

    #[error("image size mismatch: expected {expected}, got {actual}")]
    ImageSizeMismatch { expected: u64, actual: usize },

    #[error("serialize error: {0}")]
    Serialize(String),
}

impl SnapshotManifest {
    pub fn new(position: u64, leadership_term: u64, digest: [u8; 16], image: Vec<u8>) -> Self {
        SnapshotManifest {
            position,
            leadership_term,
            digest,
            image,
        }
    }

    fn serialize_header(&self) -> [u8; SNAPSHOT_HEADER_SIZE] {
        let mut header = [0u8; SNAPSHOT_HEADER_SIZE];

        header[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
        header[4..6].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        header[6..8].copy_from_slice(&0u16.to_le_bytes());
        header[8..16].copy_from_slice(&self.position.to_le_bytes());
        header[16..24].copy_from_slice(&self.leadership_term.to_le_bytes());
        header[24..40].copy_from_slice(&self.digest);
        header[40..48].copy_from_slice(&(self.image.len() as u64).to_le_bytes());

        let image_checksum = crc32c::crc32c(&self.image);
        header[48..52].copy_from_slice(&image_checksum.to_le_bytes());

        // reserved (56..64) - already zero

        let header_checksum = crc32c::crc32c(&header[0..52]);
        header[52..56].copy_from_slice(&header_checksum.to_le_bytes());

        header
    }

    /// Full file contents: header followed by the image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + self.image.len());
        bytes.extend_from_slice(&self.serialize_header());
        bytes.extend_from_slice(&self.image);
        bytes
    }

    /// Parse and validate file contents.
    ///
    /// Magic, version, both checksums and the image size must all match.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let header = bytes.get(..SNAPSHOT_HEADER_SIZE).ok_or(SnapshotError::FileTooSmall)?;

        if header[0..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let stored_header_checksum = read_u32(&header[52..56]);
        let computed_header_checksum = crc32c::crc32c(&header[0..52]);
        if stored_header_checksum != computed_header_checksum {
            return Err(SnapshotError::HeaderChecksumMismatch {
                expected: stored_header_checksum,
                actual: computed_header_checksum,
            });
        }

        let position = read_u64(&header[8..16]);
        let leadership_term = read_u64(&header[16..24]);
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&header[24..40]);
        let image_size = read_u64(&header[40..48]);
        let stored_image_checksum = read_u32(&header[48..52]);

        let image = &bytes[SNAPSHOT_HEADER_SIZE..];
        if image.len() as u64 != image_size {
            return Err(SnapshotError::ImageSizeMismatch {
                expected: image_size,
                actual: image.len(),
            });
        }

        let computed_image_checksum = crc32c::crc32c(image);
        if stored_image_checksum != computed_image_checksum {
            return Err(SnapshotError::ImageChecksumMismatch {
                expected: stored_image_checksum,
                actual: computed_image_checksum,
            });
        }

        Ok(SnapshotManifest {
            position,
            leadership_term,
            digest,
            image: image.to_vec(),
        })
    }

    /// Save snapshot to file atomically.
    ///
    /// Write to a temporary file, fsync, then rename over `path`. No partial
    /// snapshot is ever visible under the final name.
    pub fn save_to_file(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("snap.tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&self.to_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Load snapshot from file with strict validation.
    pub fn load_from_file(path: &Path) -> Result<Self, SnapshotError> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Generate the snapshot filename for a given position.
    pub fn filename_for_position(position: u64) -> String {
        format!("snapshot_{:020}.snap", position)
    }

    /// Parse the position from a snapshot filename.
    pub fn position_from_filename(filename: &str) -> Option<u64> {
        // "snapshot_" (9) + position (20) + ".snap" (5) = 34
        if !filename.starts_with("snapshot_") || !filename.ends_with(".snap") || filename.len() != 34 {
            return None;
        }
        filename[9..29].parse().ok()
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

// =============================================================================
// RECORDERS
// =============================================================================

/// Durable store for snapshot manifests.
pub trait Recorder: Send {
    /// Persist `manifest`. Must be durable when this returns.
    fn record(&mut self, manifest: &SnapshotManifest) -> Result<(), SnapshotError>;

    /// The newest manifest that passes validation, if any.
    fn latest(&self) -> Result<Option<SnapshotManifest>, SnapshotError>;
}

/// Recorder writing one file per snapshot into a directory.
#[derive(Debug, Clone)]
pub struct FileRecorder {
    dir: PathBuf,
    /// Number of newest snapshots kept after each record.
    retain: usize,
}

impl FileRecorder {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Self {
        FileRecorder {
            dir: dir.into(),
            retain: retain.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot positions present in the directory, newest first.
    pub fn positions(&self) -> Result<Vec<u64>, SnapshotError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut positions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let filename = entry.file_name();
            if let Some(position) = SnapshotManifest::position_from_filename(&filename.to_string_lossy()) {
                positions.push(position);
            }
        }
        positions.sort_by(|a, b| b.cmp(a));
        Ok(positions)
    }

    fn cleanup(&self) -> Result<(), SnapshotError> {
        for position in self.positions()?.into_iter().skip(self.retain) {
            let path = self.dir.join(SnapshotManifest::filename_for_position(position));
            if let Err(e) = fs::remove_file(&path) {
                warn!(position, error = %e, "failed to delete old snapshot");
            }
        }
        Ok(())
    }
}

impl Recorder for FileRecorder {
    fn record(&mut self, manifest: &SnapshotManifest) -> Result<(), SnapshotError> {
        let path = self.dir.join(SnapshotManifest::filename_for_position(manifest.position));
        manifest.save_to_file(&path)?;
        debug!(position = manifest.position, path = %path.display(), "snapshot recorded");
        self.cleanup()
    }

    fn latest(&self) -> Result<Option<SnapshotManifest>, SnapshotError> {
        for position in self.positions()? {
            let path = self.dir.join(SnapshotManifest::filename_for_position(position));
            match SnapshotManifest::load_from_file(&path) {
                Ok(manifest) => return Ok(Some(manifest)),
                Err(e) => warn!(position, error = %e, "snapshot failed validation, trying older"),
            }
        }
        Ok(None)
    }
}

/// In-memory recorder. Clones share storage, so a restarted node can reuse it.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    snapshots: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Flip a byte in the newest recorded snapshot.
    pub fn corrupt_latest(&self, offset: usize) {
        if let Some(bytes) = self.lock().last_mut() {
            if let Some(b) = bytes.get_mut(offset) {
                *b ^= 0xFF;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, manifest: &SnapshotManifest) -> Result<(), SnapshotError> {
        self.lock().push(manifest.to_bytes());
        Ok(())
    }

    fn latest(&self) -> Result<Option<SnapshotManifest>, SnapshotError> {
        for bytes in self.lock().iter().rev() {
            match SnapshotManifest::from_bytes(bytes) {
                Ok(manifest) => return Ok(Some(manifest)),
                Err(e) => warn!(error = %e, "snapshot failed validation, trying older"),
            }
        }
        Ok(None)
    }
}

// =============================================================================
// TESTS
// =============================================================================
