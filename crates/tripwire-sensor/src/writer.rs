//! Append-only event log writer.
//!
//! Each classified request becomes one JSON line in the log. Appends go
//! through a single lock so concurrent handlers never interleave bytes, and
//! the file is opened with `O_APPEND` so the writer never seeks.
//!
//! A crash can leave a partial last line. On open the writer terminates such a
//! fragment with a newline; the fragment then reads as one malformed line that
//! the indexer skips instead of corrupting the next event.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use tripwire_core::AttackEvent;

use crate::error::Result;

/// Configuration for the event writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Path of the JSON-lines event log.
    pub path: PathBuf,

    /// `fsync` file data after every append.
    /// Default: true
    pub fsync: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./logs/attacks.jsonl"),
            fsync: true,
        }
    }
}

struct OpenLog {
    file: File,
    identity: Option<u64>,
}

struct WriterState {
    log: Option<OpenLog>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Durable, serialized appender for attack events.
pub struct EventWriter {
    config: WriterConfig,
    state: Mutex<WriterState>,
    appended: AtomicU64,
}

#[cfg(unix)]
fn file_identity(meta: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &fs::Metadata) -> Option<u64> {
    None
}

impl EventWriter {
    /// Open (or create) the event log.
    pub fn open(config: WriterConfig) -> Result<Self> {
        let log = open_log(&config.path)?;
        info!(path = %config.path.display(), fsync = config.fsync, "event log opened");
        Ok(Self {
            config,
            state: Mutex::new(WriterState {
                log: Some(log),
                last_timestamp: None,
            }),
            appended: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Events appended by this writer since it was opened.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Append one event and return it as written.
    ///
    /// The timestamp is raised to the last written timestamp if the clock
    /// went backwards, so the log is ordered by time within this writer.
    pub fn append(&self, mut event: AttackEvent) -> Result<AttackEvent> {
        let mut state = self.state.lock();

        if let Some(last) = state.last_timestamp
            && event.timestamp < last
        {
            event.timestamp = last;
        }

        let mut line = event.to_line()?.into_bytes();
        line.push(b'\n');

        let mut log = match state.log.take() {
            Some(log) if !self.needs_reopen(&log) => log,
            _ => open_log(&self.config.path)?,
        };

        // On failure the handle is dropped; the next append reopens and
        // terminates any partial line.
        log.file.write_all(&line)?;
        if self.config.fsync {
            log.file.sync_data()?;
        }
        state.log = Some(log);

        state.last_timestamp = Some(event.timestamp);
        self.appended.fetch_add(1, Ordering::Relaxed);
        debug!(category = %event.category, ip = %event.source_ip, "event appended");
        Ok(event)
    }

    /// Append an event without failing the caller.
    ///
    /// Returns whether the event reached the log. Failures are logged and
    /// counted in `sensor_write_errors_total`.
    pub fn record(&self, event: AttackEvent) -> bool {
        let category = event.category;
        match self.append(event) {
            Ok(_) => true,
            Err(e) => {
                error!(
                    error = %e,
                    category = %category,
                    path = %self.config.path.display(),
                    "failed to append attack event"
                );
                tripwire_core::metrics::increment("sensor_write_errors_total", 1);
                false
            }
        }
    }

    /// The path was removed or now names a different file (rotation).
    fn needs_reopen(&self, log: &OpenLog) -> bool {
        match fs::metadata(&self.config.path) {
            Ok(meta) => {
                let current = file_identity(&meta);
                current.is_some() && current != log.identity
            }
            Err(_) => true,
        }
    }
}

fn open_log(path: &Path) -> Result<OpenLog> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;

    terminate_fragment(&mut file, path)?;

    let identity = file_identity(&file.metadata()?);
    Ok(OpenLog { file, identity })
}

/// Newline-terminate a trailing partial line left by an interrupted write.
fn terminate_fragment(file: &mut File, path: &Path) -> Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;

    if last[0] != b'\n' {
        warn!(path = %path.display(), len, "event log ends in a partial line, terminating it");
        file.write_all(b"\n")?;
        file.sync_data()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;
    use tripwire_core::{AttackCategory, GeoInfo};

    fn event(details: &str) -> AttackEvent {
        AttackEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            category: AttackCategory::NotFound,
            source_ip: "203.0.113.1".to_string(),
            method: "GET".to_string(),
            path: "/x".to_string(),
            user_agent: "test".to_string(),
            details: details.to_string(),
            geo: GeoInfo::unknown(),
        }
    }

    fn writer(dir: &TempDir) -> EventWriter {
        EventWriter::open(WriterConfig {
            path: dir.path().join("logs").join("attacks.jsonl"),
            fsync: true,
        })
        .unwrap()
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_append_writes_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        w.append(event("a")).unwrap();
        w.append(event("b")).unwrap();

        let lines = lines(w.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(AttackEvent::from_line(lines[0].as_bytes()).unwrap().details, "a");
        assert_eq!(AttackEvent::from_line(lines[1].as_bytes()).unwrap().details, "b");
        assert!(fs::read_to_string(w.path()).unwrap().ends_with('\n'));
        assert_eq!(w.appended(), 2);
    }

    #[test]
    fn test_existing_log_is_appended_to() {
        let dir = TempDir::new().unwrap();
        writer(&dir).append(event("first")).unwrap();
        let w = writer(&dir);
        w.append(event("second")).unwrap();
        assert_eq!(lines(w.path()).len(), 2);
    }

    #[test]
    fn test_partial_line_is_terminated_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attacks.jsonl");
        let good = event("ok").to_line().unwrap();
        fs::write(&path, format!("{}\n{{\"timestamp\":\"2024", good)).unwrap();

        let w = EventWriter::open(WriterConfig {
            path: path.clone(),
            fsync: false,
        })
        .unwrap();
        w.append(event("after")).unwrap();

        let lines = lines(&path);
        assert_eq!(lines.len(), 3);
        assert!(AttackEvent::from_line(lines[1].as_bytes()).is_err());
        assert_eq!(AttackEvent::from_line(lines[2].as_bytes()).unwrap().details, "after");
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        let first = w.append(event("a")).unwrap();

        let mut earlier = event("b");
        earlier.timestamp = first.timestamp - Duration::seconds(5);
        let written = w.append(earlier).unwrap();
        assert_eq!(written.timestamp, first.timestamp);

        let mut later = event("c");
        later.timestamp = first.timestamp + Duration::seconds(5);
        assert_eq!(w.append(later).unwrap().timestamp, first.timestamp + Duration::seconds(5));
    }

    #[test]
    fn test_reopens_after_rotation() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        w.append(event("old")).unwrap();

        let rotated = dir.path().join("logs").join("attacks.jsonl.1");
        fs::rename(w.path(), &rotated).unwrap();
        w.append(event("new")).unwrap();

        assert_eq!(lines(&rotated).len(), 1);
        let current = lines(w.path());
        assert_eq!(current.len(), 1);
        assert!(current[0].contains("\"new\""));
    }

    #[test]
    fn test_record_swallows_failures() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        assert!(w.record(event("ok")));

        // Replace the log directory with a plain file so reopening fails.
        let logs = dir.path().join("logs");
        fs::remove_dir_all(&logs).unwrap();
        fs::write(&logs, b"not a directory").unwrap();

        assert!(!w.record(event("lost")));
        assert!(w.append(event("lost")).is_err());
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let w = std::sync::Arc::new(writer(&dir));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let w = w.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        w.append(event(&format!("{}-{}", t, i))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let lines = lines(w.path());
        assert_eq!(lines.len(), 200);
        for line in lines {
            AttackEvent::from_line(line.as_bytes()).unwrap();
        }
    }
}
