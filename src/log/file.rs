//! Directory-backed log store.
//!
//! Layout:
//!
//! ```text
//! <root>/MANIFEST              store magic + version
//! <root>/LOCK                  exclusive lock held while the store is open
//! <root>/logs/<name>/OPTIONS   log options (rmp + crc32)
//! <root>/logs/<name>/journal   appends and status changes
//! ```
//!
//! Each log is a [`RingLog`] with a journal attached, so capacity,
//! eviction and tailing behave exactly as in [`super::MemoryStore`].

use super::journal::Journal;
use super::ring::RingLog;
use super::{validate_log_name, validate_options, LogStore, OrderedLog};
use crate::error::{Result, TransportError};
use crate::types::LogOptions;
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"CTS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Magic bytes for a log's options file.
const OPTIONS_MAGIC: &[u8; 4] = b"LOG\0";

/// Current options format version.
const OPTIONS_VERSION: u8 = 1;

const LOGS_DIR: &str = "logs";
const OPTIONS_FILE: &str = "OPTIONS";
const JOURNAL_FILE: &str = "journal";

/// File store configuration.
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Fsync the journal every N writes (0 or 1 = every write).
    pub sync_every: u64,

    /// Journals smaller than this are never compacted.
    pub compact_min_bytes: u64,

    /// Kill tail cursors that wait this long without a match (None = never).
    pub cursor_idle_timeout: Option<Duration>,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./transport"),
            create_if_missing: true,
            sync_every: 100,
            compact_min_bytes: 1024 * 1024, // 1MB
            cursor_idle_timeout: None,
        }
    }
}

struct FileStoreInner {
    config: FileStoreConfig,
    /// Lock file for exclusive access.
    _lock_file: File,
    /// Logs opened so far.
    logs: RwLock<HashMap<String, Arc<RingLog>>>,
    closed: Arc<AtomicBool>,
}

/// Log store persisting each log to a journal on disk.
///
/// Cloning is cheap and clones share the same open logs.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileStoreInner>,
}

impl FileStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: FileStoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(TransportError::StoreUnavailable(format!(
                "no store at {}",
                config.path.display()
            )))
        }
    }

    /// Create a new store.
    pub fn create(config: FileStoreConfig) -> Result<Self> {
        fs::create_dir_all(config.path.join(LOGS_DIR))?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        info!(path = %config.path.display(), "file store created");
        Ok(Self::from_parts(config, lock_file))
    }

    /// Open an existing store.
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;
        fs::create_dir_all(config.path.join(LOGS_DIR))?;

        info!(path = %config.path.display(), "file store opened");
        Ok(Self::from_parts(config, lock_file))
    }

    fn from_parts(config: FileStoreConfig, lock_file: File) -> Self {
        Self {
            inner: Arc::new(FileStoreInner {
                config,
                _lock_file: lock_file,
                logs: RwLock::new(HashMap::new()),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Sync every open journal to disk.
    pub fn sync(&self) -> Result<()> {
        for log in self.inner.logs.read().values() {
            log.sync()?;
        }
        Ok(())
    }

    /// Shut the store down. Every later operation fails with
    /// `StoreUnavailable` and waiting cursors die.
    pub fn close(&self) -> Result<()> {
        self.sync()?;
        self.inner.closed.store(true, Ordering::Release);
        for log in self.inner.logs.read().values() {
            log.wake_all();
        }
        info!(path = %self.path().display(), "file store closed");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(TransportError::StoreUnavailable("store is closed".into()))
        } else {
            Ok(())
        }
    }

    fn log_dir(&self, name: &str) -> PathBuf {
        self.inner.config.path.join(LOGS_DIR).join(name)
    }

    /// Load a log from disk into the open set. Caller holds the write lock.
    fn load_log(
        &self,
        logs: &mut HashMap<String, Arc<RingLog>>,
        name: &str,
    ) -> Result<Option<Arc<RingLog>>> {
        if let Some(log) = logs.get(name) {
            return Ok(Some(Arc::clone(log)));
        }

        let dir = self.log_dir(name);
        if !dir.join(OPTIONS_FILE).exists() {
            return Ok(None);
        }

        let options = Self::read_options(&dir)?;
        let journal_path = dir.join(JOURNAL_FILE);
        let (journal, replay) = if journal_path.exists() {
            Journal::open(&journal_path, self.inner.config.sync_every)?
        } else {
            (Journal::create(&journal_path, self.inner.config.sync_every)?, Vec::new())
        };
        let replayed = replay.len();

        let log = Arc::new(RingLog::with_journal(
            name,
            options,
            Arc::clone(&self.inner.closed),
            self.inner.config.cursor_idle_timeout,
            journal,
            replay,
            self.inner.config.compact_min_bytes,
        ));
        info!(log = %name, entries = replayed, "log loaded from journal");

        logs.insert(name.to_string(), Arc::clone(&log));
        Ok(Some(log))
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(TransportError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(TransportError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| TransportError::Locked)?;

        Ok(lock_file)
    }

    fn write_options(dir: &Path, options: &LogOptions) -> Result<()> {
        let encoded = rmp_serde::to_vec(options)?;
        let mut file = File::create(dir.join(OPTIONS_FILE))?;

        file.write_all(OPTIONS_MAGIC)?;
        file.write_all(&[OPTIONS_VERSION])?;
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        file.sync_all()?;

        Ok(())
    }

    fn read_options(dir: &Path) -> Result<LogOptions> {
        let mut bytes = Vec::new();
        File::open(dir.join(OPTIONS_FILE))?.read_to_end(&mut bytes)?;

        if bytes.len() < 9 || &bytes[0..4] != OPTIONS_MAGIC {
            return Err(TransportError::InvalidFormat("Invalid log options magic".into()));
        }
        if bytes[4] != OPTIONS_VERSION {
            return Err(TransportError::InvalidFormat(format!(
                "Unsupported log options version: {}",
                bytes[4]
            )));
        }

        let len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let body_end = 9 + len;
        if bytes.len() != body_end + 4 {
            return Err(TransportError::Corruption("log options truncated".into()));
        }

        let encoded = &bytes[9..body_end];
        let stored = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        if stored != crc32fast::hash(encoded) {
            return Err(TransportError::Corruption("log options checksum mismatch".into()));
        }

        Ok(rmp_serde::from_slice(encoded)?)
    }
}

impl LogStore for FileStore {
    type Log = RingLog;

    fn log_names(&self) -> Result<Vec<String>> {
        self.check_open()?;

        let mut names = Vec::new();
        for entry in fs::read_dir(self.inner.config.path.join(LOGS_DIR))? {
            let entry = entry?;
            if entry.path().join(OPTIONS_FILE).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn log_options(&self, name: &str) -> Result<Option<LogOptions>> {
        self.check_open()?;
        validate_log_name(name)?;

        if let Some(log) = self.inner.logs.read().get(name) {
            return Ok(Some(*log.options()));
        }

        let dir = self.log_dir(name);
        if dir.join(OPTIONS_FILE).exists() {
            Ok(Some(Self::read_options(&dir)?))
        } else {
            Ok(None)
        }
    }

    fn open_log(&self, name: &str) -> Result<Option<Arc<RingLog>>> {
        self.check_open()?;
        validate_log_name(name)?;

        let mut logs = self.inner.logs.write();
        self.load_log(&mut logs, name)
    }

    fn create_log(&self, name: &str, options: LogOptions) -> Result<Arc<RingLog>> {
        self.check_open()?;
        validate_log_name(name)?;
        validate_options(&options)?;

        let mut logs = self.inner.logs.write();
        if let Some(existing) = self.load_log(&mut logs, name)? {
            if *existing.options() != options {
                return Err(TransportError::Configuration(format!(
                    "log {} exists with options {:?}, requested {:?}",
                    name,
                    existing.options(),
                    options
                )));
            }
            return Ok(existing);
        }

        let dir = self.log_dir(name);
        fs::create_dir_all(&dir)?;
        let journal = Journal::create(dir.join(JOURNAL_FILE), self.inner.config.sync_every)?;
        Self::write_options(&dir, &options)?;

        let log = Arc::new(RingLog::with_journal(
            name,
            options,
            Arc::clone(&self.inner.closed),
            self.inner.config.cursor_idle_timeout,
            journal,
            Vec::new(),
            self.inner.config.compact_min_bytes,
        ));
        logs.insert(name.to_string(), Arc::clone(&log));
        Ok(log)
    }

    fn drop_log(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        validate_log_name(name)?;

        let mut logs = self.inner.logs.write();
        if let Some(log) = logs.remove(name) {
            log.mark_dropped();
        }

        let dir = self.log_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
