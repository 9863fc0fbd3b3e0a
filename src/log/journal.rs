//! Append-only journal backing a persistent log.
//!
//! Every append and status change is written here before it is applied in
//! memory. On open the journal is replayed; a torn or corrupt tail (a crash
//! mid-write) is cut off at the last intact frame.

use crate::error::{Result, TransportError};
use crate::types::{Message, Sequence, Status, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"JRN\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Magic + version.
const HEADER_SIZE: u64 = 5;

/// Upper bound on a single frame, anything larger is treated as corruption.
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// A change recorded in the journal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum JournalEntry {
    /// A record was appended.
    Append(Message),
    /// A record changed status.
    Status {
        sequence: Sequence,
        status: Status,
        at: Timestamp,
    },
}

/// Journal file writer.
pub(crate) struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Current file size.
    size: u64,
    writes_since_sync: u64,
    /// Fsync every N writes.
    sync_every: u64,
}

impl Journal {
    /// Create a fresh, empty journal (truncating any existing file).
    pub fn create(path: impl AsRef<Path>, sync_every: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::write_header(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            size: HEADER_SIZE,
            writes_since_sync: 0,
            sync_every: sync_every.max(1),
        })
    }

    /// Open an existing journal and read back its entries.
    pub fn open(path: impl AsRef<Path>, sync_every: u64) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        // Verify header
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(TransportError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(TransportError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut entries = Vec::new();
        let mut good_size = HEADER_SIZE;
        while good_size < file_size {
            match Self::read_entry(&mut reader) {
                Ok((entry, frame_size)) => {
                    entries.push(entry);
                    good_size += frame_size;
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        offset = good_size,
                        error = %e,
                        "journal tail unreadable, truncating"
                    );
                    break;
                }
            }
        }

        let file = OpenOptions::new().write(true).open(&path)?;
        if good_size < file_size {
            file.set_len(good_size)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok((
            Self {
                path,
                writer: BufWriter::new(file),
                size: good_size,
                writes_since_sync: 0,
                sync_every: sync_every.max(1),
            },
            entries,
        ))
    }

    /// Write an entry.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let frame_size = Self::write_entry(&mut self.writer, entry)?;
        self.writer.flush()?;
        self.size += frame_size;

        self.writes_since_sync += 1;
        if self.writes_since_sync >= self.sync_every {
            self.writer.get_ref().sync_data()?;
            self.writes_since_sync = 0;
        }

        Ok(())
    }

    /// Replace the journal with one `Append` entry per retained record.
    ///
    /// The new journal is written next to the old one and renamed over it.
    pub fn rewrite<'a>(&mut self, messages: impl Iterator<Item = &'a Message>) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");

        let mut size = HEADER_SIZE;
        {
            let mut writer = BufWriter::new(Self::write_header(&tmp_path)?);
            for message in messages {
                size += Self::write_entry(&mut writer, &JournalEntry::Append(message.clone()))?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        // The handle follows the file through the rename.
        let writer = BufWriter::new(OpenOptions::new().append(true).open(&tmp_path)?);
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        self.writer = writer;
        self.size = size;
        self.writes_since_sync = 0;

        Ok(())
    }

    /// Force pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn write_header(path: &Path) -> Result<File> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;

        Ok(file)
    }

    /// Frame: length, rmp payload, crc32. Returns bytes written.
    fn write_entry(writer: &mut BufWriter<File>, entry: &JournalEntry) -> Result<u64> {
        let encoded = rmp_serde::to_vec(entry)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(4 + encoded.len() as u64 + 4)
    }

    fn read_entry(reader: &mut BufReader<File>) -> Result<(JournalEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::Corruption("journal frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(TransportError::Corruption("journal checksum mismatch".into()));
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((entry, 4 + len as u64 + 4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PayloadEncoding;
    use tempfile::TempDir;

    fn message(sequence: u64) -> Message {
        Message {
            sequence: Sequence(sequence),
            topic: "t".to_string(),
            status: Status::Pending,
            published_at: Timestamp::now(),
            claimed_at: None,
            completed_at: None,
            payload: format!("{{\"n\":{}}}", sequence).into_bytes(),
            encoding: PayloadEncoding::Json,
        }
    }

    #[test]
    fn test_journal_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        {
            let mut journal = Journal::create(&path, 1).unwrap();
            journal.append(&JournalEntry::Append(message(1))).unwrap();
            journal
                .append(&JournalEntry::Status {
                    sequence: Sequence(1),
                    status: Status::Processed,
                    at: Timestamp(42),
                })
                .unwrap();
        }

        let (journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries.len(), 2);
        match &entries[0] {
            JournalEntry::Append(m) => {
                assert_eq!(m.sequence, Sequence(1));
                assert_eq!(m.payload, message(1).payload);
            }
            other => panic!("Expected append, got {:?}", other),
        }
        assert!(matches!(
            entries[1],
            JournalEntry::Status {
                sequence: Sequence(1),
                status: Status::Processed,
                ..
            }
        ));
        assert_eq!(journal.size(), fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        let intact_size = {
            let mut journal = Journal::create(&path, 1).unwrap();
            journal.append(&JournalEntry::Append(message(1))).unwrap();
            journal.append(&JournalEntry::Append(message(2))).unwrap();
            journal.size()
        };

        // Simulate a crash halfway through a third frame.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&200u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
        }

        let (mut journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(journal.size(), intact_size);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_size);

        // Writing continues from the intact prefix.
        journal.append(&JournalEntry::Append(message(3))).unwrap();
        drop(journal);

        let (_, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        {
            let mut journal = Journal::create(&path, 1).unwrap();
            journal.append(&JournalEntry::Append(message(1))).unwrap();
        }

        // Flip the last checksum byte.
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let (journal, entries) = Journal::open(&path, 1).unwrap();
        assert!(entries.is_empty());
        assert_eq!(journal.size(), HEADER_SIZE);
    }

    #[test]
    fn test_rewrite_keeps_only_given_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        let mut journal = Journal::create(&path, 100).unwrap();
        for seq in 1..=10 {
            journal.append(&JournalEntry::Append(message(seq))).unwrap();
        }
        let before = journal.size();

        let retained: Vec<Message> = (8..=10).map(message).collect();
        journal.rewrite(retained.iter()).unwrap();
        assert!(journal.size() < before);

        journal.append(&JournalEntry::Append(message(11))).unwrap();
        drop(journal);

        let (_, entries) = Journal::open(&path, 100).unwrap();
        let sequences: Vec<u64> = entries
            .iter()
            .map(|e| match e {
                JournalEntry::Append(m) => m.sequence.0,
                JournalEntry::Status { sequence, .. } => sequence.0,
            })
            .collect();
        assert_eq!(sequences, vec![8, 9, 10, 11]);
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");
        fs::write(&path, b"NOPE\x01").unwrap();

        assert!(matches!(
            Journal::open(&path, 1),
            Err(TransportError::InvalidFormat(_))
        ));
    }
}
