//! In-process log store.

use super::ring::RingLog;
use super::{validate_log_name, validate_options, LogStore, OrderedLog};
use crate::error::{Result, TransportError};
use crate::types::LogOptions;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Memory store configuration.
#[derive(Clone, Debug, Default)]
pub struct MemoryStoreConfig {
    /// Kill tail cursors that wait this long without a match (None = never).
    pub cursor_idle_timeout: Option<Duration>,
}

struct MemoryStoreInner {
    config: MemoryStoreConfig,
    logs: RwLock<HashMap<String, Arc<RingLog>>>,
    closed: Arc<AtomicBool>,
}

/// Log store that keeps every log in process memory.
///
/// Cloning is cheap and clones share the same logs.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                config,
                logs: RwLock::new(HashMap::new()),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Shut the store down. Every later operation fails with
    /// `StoreUnavailable` and waiting cursors die.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for log in self.inner.logs.read().values() {
            log.wake_all();
        }
        info!("memory store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(TransportError::StoreUnavailable("store is closed".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryStore {
    type Log = RingLog;

    fn log_names(&self) -> Result<Vec<String>> {
        self.check_open()?;
        let mut names: Vec<String> = self.inner.logs.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn log_options(&self, name: &str) -> Result<Option<LogOptions>> {
        self.check_open()?;
        Ok(self.inner.logs.read().get(name).map(|log| *log.options()))
    }

    fn open_log(&self, name: &str) -> Result<Option<Arc<RingLog>>> {
        self.check_open()?;
        Ok(self.inner.logs.read().get(name).cloned())
    }

    fn create_log(&self, name: &str, options: LogOptions) -> Result<Arc<RingLog>> {
        self.check_open()?;
        validate_log_name(name)?;
        validate_options(&options)?;

        let mut logs = self.inner.logs.write();
        if let Some(existing) = logs.get(name) {
            if *existing.options() != options {
                return Err(TransportError::Configuration(format!(
                    "log {} exists with options {:?}, requested {:?}",
                    name,
                    existing.options(),
                    options
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let log = Arc::new(RingLog::new(
            name,
            options,
            Arc::clone(&self.inner.closed),
            self.inner.config.cursor_idle_timeout,
        ));
        logs.insert(name.to_string(), Arc::clone(&log));
        Ok(log)
    }

    fn drop_log(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        match self.inner.logs.write().remove(name) {
            Some(log) => {
                log.mark_dropped();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
