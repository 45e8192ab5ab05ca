//! Relay-side room document storage.
//!
//! One Automerge document per effective room:
//! ```text
//! <DATA_DIR>/
//!   sunny-teal-otter.automerge
//!   sunny-teal-otter__epoch__2.automerge
//! ```

use automerge::AutoCommit;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

/// Errors that can occur during room storage operations.
#[derive(Debug)]
pub enum RoomStorageError {
    /// I/O error reading or writing a file.
    IoError(PathBuf, io::Error),
    /// Error loading/parsing an Automerge document.
    AutomergeError(PathBuf, String),
    /// Invalid room name (e.g., contains path separators).
    InvalidRoom(String),
}

impl std::fmt::Display for RoomStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomStorageError::IoError(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
            RoomStorageError::AutomergeError(path, e) => {
                write!(f, "Failed to load document {}: {}", path.display(), e)
            }
            RoomStorageError::InvalidRoom(room) => write!(f, "Invalid room name: {}", room),
        }
    }
}

impl std::error::Error for RoomStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RoomStorageError::IoError(_, e) => Some(e),
            _ => None,
        }
    }
}

/// Room documents on disk.
#[derive(Debug, Clone)]
pub struct RoomStorage {
    data_dir: PathBuf,
}

impl RoomStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Rejects room names that could escape the data directory.
    pub fn validate_room(room: &str) -> Result<(), RoomStorageError> {
        if room.is_empty()
            || room.contains('/')
            || room.contains('\\')
            || room.contains("..")
            || room.starts_with('.')
            || room.chars().any(char::is_control)
        {
            return Err(RoomStorageError::InvalidRoom(room.to_string()));
        }
        Ok(())
    }

    fn doc_path(&self, room: &str) -> PathBuf {
        self.data_dir.join(format!("{}.automerge", room))
    }

    /// Loads a room's document.
    ///
    /// Returns `Ok(None)` if nothing was stored for the room yet.
    pub fn load(&self, room: &str) -> Result<Option<AutoCommit>, RoomStorageError> {
        Self::validate_room(room)?;
        let path = self.doc_path(room);

        match fs::read(&path) {
            Ok(bytes) => AutoCommit::load(&bytes)
                .map(Some)
                .map_err(|e| RoomStorageError::AutomergeError(path, e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RoomStorageError::IoError(path, e)),
        }
    }

    /// Saves a room's document, creating the data directory if needed.
    pub fn save(&self, room: &str, doc: &mut AutoCommit) -> Result<(), RoomStorageError> {
        Self::validate_room(room)?;

        fs::create_dir_all(&self.data_dir)
            .map_err(|e| RoomStorageError::IoError(self.data_dir.clone(), e))?;

        let path = self.doc_path(room);
        let bytes = doc.save();

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("automerge.tmp");
        let mut file = File::create(&temp_path)
            .map_err(|e| RoomStorageError::IoError(temp_path.clone(), e))?;
        file.write_all(&bytes)
            .map_err(|e| RoomStorageError::IoError(temp_path.clone(), e))?;
        file.sync_all()
            .map_err(|e| RoomStorageError::IoError(temp_path.clone(), e))?;

        fs::rename(&temp_path, &path).map_err(|e| RoomStorageError::IoError(path, e))?;
        Ok(())
    }

    pub fn exists(&self, room: &str) -> Result<bool, RoomStorageError> {
        Self::validate_room(room)?;
        Ok(self.doc_path(room).exists())
    }
}
