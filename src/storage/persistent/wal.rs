//! Append-only mutation log.
//!
//! Every store mutation is appended here before it is applied in memory; on
//! open the log is replayed to rebuild state. A torn tail (crash mid-write) is
//! cut off so that later appends stay readable.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-framed WalEntry]
//! [ENTRY 2: codec-framed WalEntry]
//! ...
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::{ScheduleId, ScheduleRecord};
use crate::trigger::{TriggerId, TriggerRow};

use super::codec;

/// A single entry in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation.
    pub kind: WalEntryKind,
}

/// The mutation recorded by a [`WalEntry`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    TriggerInsert(TriggerRow),
    TriggerDelete { id: TriggerId },
    TriggerFired { id: TriggerId, timestamp: f64 },

    ScheduleInsert(ScheduleRecord),
    ScheduleDelete { id: ScheduleId },
    ScheduleEnabled { id: ScheduleId, enabled: bool },
}

struct WalWriter {
    out: BufWriter<File>,
    sequence: u64,
}

/// Write-ahead log, thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal.writer")
}

impl WriteAheadLog {
    /// Open or create a log, returning it with every recoverable entry.
    ///
    /// Replay stops at the first torn or corrupted record; the file is
    /// truncated to the last good record.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<(Self, Vec<WalEntry>)> {
        let has_header = path.exists() && fs::metadata(path)?.len() >= codec::HEADER_LEN;
        if !has_header {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
        }

        let (entries, valid_len) = Self::recover(path)?;
        let file = OpenOptions::new().write(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(path = %path.display(), valid_len, "truncating torn log tail");
            file.set_len(valid_len)?;
            if sync_on_write {
                file.sync_all()?;
            }
        }
        drop(file);

        let sequence = entries.last().map_or(0, |e| e.sequence);
        let file = OpenOptions::new().append(true).open(path)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                writer: Mutex::new(WalWriter {
                    out: BufWriter::new(file),
                    sequence,
                }),
                sync_on_write,
            },
            entries,
        ))
    }

    fn recover(path: &Path) -> IoResult<(Vec<WalEntry>, u64)> {
        let mut reader = BufReader::new(File::open(path)?);
        codec::read_header(&mut reader)?;

        let mut entries = Vec::new();
        let mut valid_len = codec::HEADER_LEN;
        loop {
            match codec::decode::<WalEntry>(&mut reader) {
                Ok((entry, used)) => {
                    valid_len += used;
                    entries.push(entry);
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        after_sequence = entries.last().map_or(0, |x: &WalEntry| x.sequence),
                        error = %e,
                        "corrupted log entry, replay stops here"
                    );
                    break;
                }
            }
        }
        Ok((entries, valid_len))
    }

    /// Append an entry. Returns its sequence number.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        let sequence = writer.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        })?;

        writer.out.write_all(&encoded)?;
        writer.out.flush()?;
        if self.sync_on_write {
            writer.out.get_ref().sync_all()?;
        }
        writer.sequence = sequence;
        Ok(sequence)
    }

    /// Replace the whole log with `kinds`, written to a side file and renamed
    /// into place.
    pub fn rewrite(&self, kinds: Vec<WalEntryKind>) -> IoResult<()> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        writer.out.flush()?;

        let tmp_path = self.path.with_extension("wal.compact");
        {
            let mut tmp = BufWriter::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            codec::write_header(&mut tmp)?;
            writer.sequence = 0;
            let timestamp = Utc::now();
            for (i, kind) in kinds.into_iter().enumerate() {
                let entry = WalEntry {
                    sequence: i as u64 + 1,
                    timestamp,
                    kind,
                };
                tmp.write_all(&codec::encode(&entry)?)?;
                writer.sequence = entry.sequence;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        writer.out = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    /// Current sequence number.
    pub fn current_sequence(&self) -> u64 {
        self.writer.lock().map_or(0, |w| w.sequence)
    }

    /// Log size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::NewTrigger;
    use tempfile::tempdir;

    fn row() -> TriggerRow {
        NewTrigger::reply("hello", "Hi!").into_row(TriggerId::new())
    }

    #[test]
    fn test_append_and_recover() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let (wal, entries) = WriteAheadLog::open(&path, false).unwrap();
        assert!(entries.is_empty());
        let r = row();
        wal.append(WalEntryKind::TriggerInsert(r.clone())).unwrap();
        wal.append(WalEntryKind::TriggerFired { id: r.id, timestamp: 12.5 }).unwrap();
        assert_eq!(wal.current_sequence(), 2);
        drop(wal);

        let (wal, entries) = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert!(matches!(entries[1].kind, WalEntryKind::TriggerFired { .. }));
        assert_eq!(wal.current_sequence(), 2);
    }

    #[test]
    fn test_torn_tail_is_cut_and_appends_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.wal");
        {
            let (wal, _) = WriteAheadLog::open(&path, true).unwrap();
            wal.append(WalEntryKind::TriggerInsert(row())).unwrap();
            wal.append(WalEntryKind::TriggerInsert(row())).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 4).unwrap();

        {
            let (wal, entries) = WriteAheadLog::open(&path, true).unwrap();
            assert_eq!(entries.len(), 1);
            wal.append(WalEntryKind::TriggerInsert(row())).unwrap();
        }

        let (_, entries) = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("compact.wal");
        let (wal, _) = WriteAheadLog::open(&path, false).unwrap();
        for _ in 0..5 {
            wal.append(WalEntryKind::TriggerInsert(row())).unwrap();
        }
        let keep = row();
        wal.rewrite(vec![WalEntryKind::TriggerInsert(keep.clone())]).unwrap();
        wal.append(WalEntryKind::TriggerDelete { id: keep.id }).unwrap();
        drop(wal);

        let (_, entries) = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
    }
}
