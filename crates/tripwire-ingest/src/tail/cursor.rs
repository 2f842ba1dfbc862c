//! Durable read position into the event log.
//!
//! The cursor is a byte offset that always sits on a line boundary, plus the
//! identity of the file it points into so a rotated log is noticed. It is
//! persisted as a small JSON file that is replaced atomically:
//!
//! ```text
//! write <path>.tmp ─► fsync ─► rename over <path>
//! ```

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Position just past the last consumed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// Byte offset into the log.
    pub offset: u64,
    /// Identity (inode) of the log file the offset refers to, when known.
    pub file_id: Option<u64>,
}

impl Cursor {
    pub fn new(offset: u64, file_id: Option<u64>) -> Self {
        Self { offset, file_id }
    }

    /// Beginning of the log.
    pub fn start() -> Self {
        Self::default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    offset: u64,
    #[serde(default)]
    file_id: Option<u64>,
    updated_at: DateTime<Utc>,
}

/// JSON file holding a [`Cursor`].
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store placed next to the log: `attacks.jsonl` -> `attacks.jsonl.cursor`.
    pub fn for_log(log_path: &Path) -> Self {
        let mut name = log_path.as_os_str().to_owned();
        name.push(".cursor");
        Self::new(PathBuf::from(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved cursor.
    ///
    /// A missing file means "start of log". A corrupt file is logged and also
    /// treated as the start: replaying is safe because document ids are
    /// derived from log content.
    pub fn load(&self) -> Result<Cursor> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no saved cursor, starting at 0");
                return Ok(Cursor::start());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<CursorFile>(&bytes) {
            Ok(saved) => Ok(Cursor::new(saved.offset, saved.file_id)),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "cursor file is corrupt, replaying from the start of the log"
                );
                Ok(Cursor::start())
            }
        }
    }

    /// Persist `cursor`, replacing the previous file atomically.
    pub fn save(&self, cursor: &Cursor) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let body = serde_json::to_vec_pretty(&CursorFile {
            offset: cursor.offset,
            file_id: cursor.file_id,
            updated_at: Utc::now(),
        })?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        {
            let mut file = File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path);

        debug!(offset = cursor.offset, "cursor saved");
        Ok(())
    }
}

/// Best effort: make the rename itself durable.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
