//! Durable storage for the session snapshot
//!
//! One snapshot is kept under a fixed location. The on-disk shape is
//! versioned (`{"version":1,"sessionInfo":…,"stats":…}`) so it can change
//! without silently corrupting restores.

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::state::{SessionInfo, SessionStats};

/// Current snapshot format
pub const SNAPSHOT_VERSION: u32 = 1;

const APP_DIR_NAME: &str = "live-translate";
const SNAPSHOT_FILE_NAME: &str = "session.json";

/// Snapshot persistence errors
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serialize(serde_json::Error),
    /// Snapshot written by an unknown format version
    UnsupportedVersion(u64),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Snapshot I/O failed: {}", e),
            StoreError::Serialize(e) => write!(f, "Snapshot is malformed: {}", e),
            StoreError::UnsupportedVersion(v) => write!(f, "Unsupported snapshot version {}", v),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Serialize(e) => Some(e),
            StoreError::UnsupportedVersion(_) => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialize(e)
    }
}

/// Persisted session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub session_info: SessionInfo,
    pub stats: SessionStats,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u64,
}

impl Snapshot {
    pub fn new(session_info: SessionInfo, stats: SessionStats) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            session_info,
            stats,
        }
    }

    pub fn encode(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored snapshot, rejecting unknown versions
    pub fn decode(contents: &str) -> Result<Self, StoreError> {
        let header: VersionHeader = serde_json::from_str(contents)?;
        if header.version != u64::from(SNAPSHOT_VERSION) {
            return Err(StoreError::UnsupportedVersion(header.version));
        }
        Ok(serde_json::from_str(contents)?)
    }
}

/// Key-value slot holding the serialized snapshot
pub trait SnapshotStore: Send + Sync {
    /// Stored contents, `None` if nothing has been written
    fn read(&self) -> Result<Option<String>, StoreError>;
    /// Replace the stored contents (last write wins)
    fn write(&self, contents: &str) -> Result<(), StoreError>;
    fn remove(&self) -> Result<(), StoreError>;
}

/// Snapshot stored as a JSON file
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the user's local data directory
    pub fn in_data_dir() -> Option<Self> {
        dirs::data_local_dir().map(|dir| Self::new(dir.join(APP_DIR_NAME).join(SNAPSHOT_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn read(&self) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, contents: &str) -> Result<(), StoreError> {
        Ok(write_atomic(&self.path, contents)?)
    }

    fn remove(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    contents: Mutex<Option<String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with raw contents
    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: Mutex::new(Some(contents.into())),
        }
    }

    pub fn contents(&self) -> Option<String> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn read(&self) -> Result<Option<String>, StoreError> {
        Ok(self.contents())
    }

    fn write(&self, contents: &str) -> Result<(), StoreError> {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents.to_string());
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Write `contents` to `path` through a temp file and rename
///
/// Creates the parent directory if needed.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents)?;

    // Windows rename fails if the destination exists
    if cfg!(windows) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    std::fs::rename(&tmp_path, path)
}
