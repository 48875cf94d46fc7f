//! Persister collaborators: where the log's entries actually live.
//!
//! The log delegates storage to a [`Persister`], mirroring the split between the
//! in-memory and durable backends elsewhere in this workspace. [`FilePersister`]
//! is the production implementation: one JSON object per line, each carrying its
//! index and timestamp, replayed from offset 0 on open. [`MemoryPersister`] backs
//! tests and debug runs.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use karl_core::{IndexAndTimestamp, MicroTimestamp};

use crate::error::{Result, StreamError};

/// One persisted entry together with its log cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry<T> {
    /// Index and timestamp assigned at publish time.
    pub idx_ts: IndexAndTimestamp,
    /// The payload.
    pub entry: T,
}

/// Storage contract for the append-only log.
///
/// Implementations must be append-only, crash-safe up to the last fully flushed
/// entry, and replayable from offset 0. Index assignment (1-based, dense) is the
/// persister's job; timestamp monotonicity is enforced by the stream above it.
pub trait Persister<T>: Send {
    /// Appends an entry with the given timestamp, returning its cursor.
    fn append(&mut self, entry: &T, us: MicroTimestamp) -> Result<IndexAndTimestamp>;

    /// Returns the number of committed entries.
    fn size(&self) -> u64;

    /// Returns the cursor of the last committed entry, if any.
    fn last_index_and_timestamp(&self) -> Option<IndexAndTimestamp>;

    /// Returns the entries with index in `[lo, hi)` (1-based, `hi` exclusive),
    /// in insertion order. Out-of-range bounds are clamped; reads never fail.
    fn range(&self, lo: u64, hi: u64) -> Vec<PersistedEntry<T>>;
}

#[allow(clippy::cast_possible_truncation)]
fn slice_range<T: Clone>(entries: &[PersistedEntry<T>], lo: u64, hi: u64) -> Vec<PersistedEntry<T>> {
    let len = entries.len() as u64;
    let lo = lo.max(1);
    let hi = hi.min(len + 1);
    if lo >= hi {
        return Vec::new();
    }
    entries[(lo - 1) as usize..(hi - 1) as usize].to_vec()
}

/// In-memory persister for tests and debug runs.
#[derive(Debug, Default)]
pub struct MemoryPersister<T> {
    entries: Vec<PersistedEntry<T>>,
}

impl<T> MemoryPersister<T> {
    /// Creates an empty in-memory persister.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: Clone + Send> Persister<T> for MemoryPersister<T> {
    fn append(&mut self, entry: &T, us: MicroTimestamp) -> Result<IndexAndTimestamp> {
        let idx_ts = IndexAndTimestamp {
            index: self.entries.len() as u64 + 1,
            us,
        };
        self.entries.push(PersistedEntry {
            idx_ts,
            entry: entry.clone(),
        });
        Ok(idx_ts)
    }

    fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_index_and_timestamp(&self) -> Option<IndexAndTimestamp> {
        self.entries.last().map(|e| e.idx_ts)
    }

    fn range(&self, lo: u64, hi: u64) -> Vec<PersistedEntry<T>> {
        slice_range(&self.entries, lo, hi)
    }
}

/// Durable JSON-lines persister.
///
/// Keeps the decoded entries in memory for reads and appends each new entry as
/// one flushed line, so a crash loses at most the entry being written.
pub struct FilePersister<T> {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: Vec<PersistedEntry<T>>,
}

impl<T> std::fmt::Debug for FilePersister<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePersister")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned> FilePersister<T> {
    /// Opens (or creates) the log at `path`, replaying any existing entries.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or an existing line is corrupt,
    /// out of order, or non-contiguous.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = Self::replay(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StreamError::io(format!("open {}", path.display()), e))?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "log opened");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            entries,
        })
    }

    fn replay(path: &Path) -> Result<Vec<PersistedEntry<T>>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StreamError::io(format!("open {}", path.display()), e)),
        };

        let mut entries: Vec<PersistedEntry<T>> = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line_number = number + 1;
            let line = line.map_err(|e| StreamError::io("read log line", e))?;
            if line.is_empty() {
                continue;
            }
            let entry: PersistedEntry<T> =
                serde_json::from_str(&line).map_err(|e| StreamError::Corrupt {
                    line: line_number,
                    message: e.to_string(),
                })?;
            let expected_index = entries.len() as u64 + 1;
            if entry.idx_ts.index != expected_index {
                return Err(StreamError::Corrupt {
                    line: line_number,
                    message: format!(
                        "index {} where {expected_index} was expected",
                        entry.idx_ts.index
                    ),
                });
            }
            if let Some(last) = entries.last() {
                if entry.idx_ts.us <= last.idx_ts.us {
                    return Err(StreamError::Corrupt {
                        line: line_number,
                        message: format!(
                            "timestamp {} does not advance past {}",
                            entry.idx_ts.us, last.idx_ts.us
                        ),
                    });
                }
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Serialize + DeserializeOwned + Clone + Send> Persister<T> for FilePersister<T> {
    fn append(&mut self, entry: &T, us: MicroTimestamp) -> Result<IndexAndTimestamp> {
        let idx_ts = IndexAndTimestamp {
            index: self.entries.len() as u64 + 1,
            us,
        };
        let persisted = PersistedEntry {
            idx_ts,
            entry: entry.clone(),
        };
        let line = serde_json::to_string(&persisted)
            .map_err(|e| StreamError::persistence(format!("encode log entry: {e}")))?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush())
            .map_err(|e| StreamError::io(format!("append to {}", self.path.display()), e))?;
        self.entries.push(persisted);
        Ok(idx_ts)
    }

    fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_index_and_timestamp(&self) -> Option<IndexAndTimestamp> {
        self.entries.last().map(|e| e.idx_ts)
    }

    fn range(&self, lo: u64, hi: u64) -> Vec<PersistedEntry<T>> {
        slice_range(&self.entries, lo, hi)
    }
}
