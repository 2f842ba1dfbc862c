//! Incremental reader for the append-only event log.
//!
//! [`LogTailer::poll`] reads whatever was appended after a [`Cursor`] and
//! returns the complete lines found there. A trailing line without its
//! newline is still being written and is left for the next poll, so the
//! returned cursor always sits on a line boundary.
//!
//! The tailer holds no position of its own; callers pass the cursor in and
//! persist the one they get back.

mod cursor;

pub use cursor::{Cursor, CursorStore};

use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::Result;

/// Configuration for the log tailer.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Event log to read.
    pub path: PathBuf,

    /// Upper bound on bytes read per poll. A single longer line is still
    /// read whole, up to `max_line_bytes`.
    /// Default: 1 MiB
    pub max_batch_bytes: usize,

    /// Longest line kept in memory. Longer complete lines are skipped; a
    /// longer unterminated line is waited on without being buffered.
    /// Default: 4 MiB
    pub max_line_bytes: usize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./logs/attacks.jsonl"),
            max_batch_bytes: 1024 * 1024,
            max_line_bytes: 4 * 1024 * 1024,
        }
    }
}

/// One complete line of the log, without its newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Offset of the first byte of the line.
    pub start: u64,
    /// Offset just past the terminating newline.
    pub end: u64,
    pub bytes: Vec<u8>,
}

/// Lines read by one poll.
#[derive(Debug)]
pub struct TailBatch {
    /// Cursor the batch was read from, after any truncation or rotation reset.
    pub from: Cursor,
    /// Cursor just past the last complete line in the batch (blank lines
    /// included).
    pub next_cursor: Cursor,
    /// The log shrank or was replaced and reading restarted at offset 0.
    pub reset: bool,
    lines: std::vec::IntoIter<LogLine>,
}

impl TailBatch {
    fn empty(from: Cursor, reset: bool) -> Self {
        Self {
            from,
            next_cursor: from,
            reset,
            lines: Vec::new().into_iter(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.len() == 0
    }
}

impl Iterator for TailBatch {
    type Item = LogLine;

    fn next(&mut self) -> Option<LogLine> {
        self.lines.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.lines.size_hint()
    }
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

/// Stateless reader over the event log.
#[derive(Debug, Clone)]
pub struct LogTailer {
    config: TailerConfig,
}

impl LogTailer {
    pub fn new(config: TailerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TailerConfig {
        &self.config
    }

    /// Read complete lines appended after `cursor`.
    ///
    /// A missing log yields an empty batch with the cursor unchanged.
    pub fn poll(&self, cursor: &Cursor) -> Result<TailBatch> {
        let path = &self.config.path;
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "event log does not exist yet");
                return Ok(TailBatch::empty(*cursor, false));
            }
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata()?;
        let len = meta.len();
        let identity = file_identity(&meta);

        let mut from = *cursor;
        let mut reset = false;
        if let (Some(known), Some(current)) = (cursor.file_id, identity)
            && known != current
        {
            warn!(
                path = %path.display(),
                offset = cursor.offset,
                "event log was replaced, reading the new file from the start"
            );
            reset = true;
        } else if cursor.offset > len {
            warn!(
                path = %path.display(),
                offset = cursor.offset,
                len,
                "event log shrank below the cursor, reading from the start"
            );
            reset = true;
        }
        if reset {
            from.offset = 0;
            tripwire_core::metrics::increment("tailer_gaps_total", 1);
        }
        from.file_id = identity;

        let available = len - from.offset;
        if available == 0 {
            return Ok(TailBatch::empty(from, reset));
        }

        file.seek(SeekFrom::Start(from.offset))?;
        let mut region = file.take(available);
        let mut buf = Vec::new();
        let first = available.min(self.config.max_batch_bytes.max(1) as u64);
        (&mut region).take(first).read_to_end(&mut buf)?;

        // A line longer than the batch bound is read to its end.
        if !buf.contains(&b'\n') && (buf.len() as u64) < available {
            let cap = self.config.max_line_bytes.max(1) as u64;
            let mut reader = BufReader::new(region);
            (&mut reader)
                .take(cap.saturating_sub(buf.len() as u64))
                .read_until(b'\n', &mut buf)?;

            if !buf.ends_with(b"\n") && buf.len() as u64 >= cap {
                return match skip_line(&mut reader)? {
                    Some(rest) => {
                        let end = from.offset + buf.len() as u64 + rest;
                        warn!(
                            offset = from.offset,
                            len = end - from.offset,
                            max_line_bytes = cap,
                            "skipping line longer than max_line_bytes"
                        );
                        tripwire_core::metrics::increment("tailer_gaps_total", 1);
                        Ok(TailBatch {
                            from,
                            next_cursor: Cursor::new(end, identity),
                            reset,
                            lines: Vec::new().into_iter(),
                        })
                    }
                    None => {
                        warn!(
                            offset = from.offset,
                            max_line_bytes = cap,
                            "unterminated line exceeds max_line_bytes, waiting for its end"
                        );
                        Ok(TailBatch::empty(from, reset))
                    }
                };
            }
        }

        let mut lines = Vec::new();
        let mut line_start = 0usize;
        for (i, byte) in buf.iter().enumerate() {
            if *byte != b'\n' {
                continue;
            }
            let raw = &buf[line_start..i];
            let content = raw.strip_suffix(b"\r").unwrap_or(raw);
            if !content.iter().all(u8::is_ascii_whitespace) {
                lines.push(LogLine {
                    start: from.offset + line_start as u64,
                    end: from.offset + i as u64 + 1,
                    bytes: content.to_vec(),
                });
            }
            line_start = i + 1;
        }

        let next_cursor = Cursor::new(from.offset + line_start as u64, identity);
        if line_start < buf.len() {
            debug!(
                offset = next_cursor.offset,
                pending = buf.len() - line_start,
                "holding back unterminated line"
            );
        }

        tripwire_core::metrics::increment("tailer_lines_read_total", lines.len() as u64);

        Ok(TailBatch {
            from,
            next_cursor,
            reset,
            lines: lines.into_iter(),
        })
    }
}

/// Consume through the next newline without keeping the bytes.
/// Returns the number of bytes consumed, or `None` at end of input.
fn skip_line(reader: &mut impl BufRead) -> std::io::Result<Option<u64>> {
    let mut skipped = 0u64;
    loop {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            return Ok(None);
        }
        if let Some(i) = chunk.iter().position(|b| *b == b'\n') {
            reader.consume(i + 1);
            return Ok(Some(skipped + i as u64 + 1));
        }
        let n = chunk.len();
        reader.consume(n);
        skipped += n as u64;
    }
}
