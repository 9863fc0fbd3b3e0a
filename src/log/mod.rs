//! Bounded ordered log stores.
//!
//! The transport only needs four capabilities from its backing store:
//! - create or open a capped log
//! - append a record
//! - tail records matching a filter, blocking for new arrivals
//! - conditionally update a record if a predicate on its state holds
//!
//! These are expressed as the [`LogStore`], [`OrderedLog`] and [`TailCursor`]
//! traits. Two stores are provided: [`MemoryStore`] keeps everything in
//! process, [`FileStore`] additionally journals every change to disk.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let log = store.create_log("events", LogOptions::capped(Capacity::default()))?;
//!
//! let mut cursor = log.tail(TailFilter::pending("orders", Sequence::ZERO))?;
//! log.append(MessageInput::json("orders", &json!({"id": 1}))?)?;
//!
//! match cursor.next_timeout(Some(Duration::from_secs(1)))? {
//!     TailNext::Message(msg) => println!("got {:?}", msg.sequence),
//!     TailNext::TimedOut => println!("nothing yet"),
//!     TailNext::Dead => println!("cursor died, reopen it"),
//! }
//! ```

mod file;
mod journal;
mod memory;
mod ring;

pub use file::{FileStore, FileStoreConfig};
pub use memory::{MemoryStore, MemoryStoreConfig};
pub use ring::{RingCursor, RingLog};

use crate::error::{Result, TransportError};
use crate::types::{LogOptions, LogStats, Message, MessageInput, Sequence, Status, Timestamp};
use std::sync::Arc;
use std::time::Duration;

/// A store holding named logs.
pub trait LogStore: Send + Sync {
    type Log: OrderedLog;

    /// Names of all logs in the store.
    fn log_names(&self) -> Result<Vec<String>>;

    /// Options of a log, or None if no log has that name.
    fn log_options(&self, name: &str) -> Result<Option<LogOptions>>;

    /// Open an existing log.
    fn open_log(&self, name: &str) -> Result<Option<Arc<Self::Log>>>;

    /// Create a log, or open it if one with identical options exists.
    ///
    /// Fails with `Configuration` if a log of that name exists with other options.
    fn create_log(&self, name: &str, options: LogOptions) -> Result<Arc<Self::Log>>;

    /// Destroy a log. Live cursors on it die. Returns false if it did not exist.
    fn drop_log(&self, name: &str) -> Result<bool>;
}

/// An append-only log ordered by [`Sequence`].
pub trait OrderedLog: Send + Sync + 'static {
    type Cursor: TailCursor + 'static;

    fn name(&self) -> &str;

    fn options(&self) -> &LogOptions;

    /// Append a pending record. May evict the oldest records.
    fn append(&self, input: MessageInput) -> Result<Message>;

    /// The most recently appended record still retained.
    fn last(&self) -> Result<Option<Message>>;

    /// Look up a retained record.
    fn get(&self, sequence: Sequence) -> Result<Option<Message>>;

    /// Non-blocking scan of retained records matching `filter`, oldest first.
    fn find(&self, filter: &TailFilter) -> Result<Vec<Message>>;

    /// Open a blocking scan over records matching `filter`, oldest first.
    fn tail(self: &Arc<Self>, filter: TailFilter) -> Result<Self::Cursor>;

    /// Set the status of `sequence` to `to` if its current status is `from`.
    ///
    /// Returns the number of records modified (0 or 1). The check and the
    /// write are atomic with respect to every other operation on the log.
    fn transition(&self, sequence: Sequence, from: Status, to: Status, at: Timestamp)
        -> Result<u64>;

    fn stats(&self) -> Result<LogStats>;
}

/// A blocking scan over a log.
pub trait TailCursor: Send {
    /// Wait for the next matching record.
    ///
    /// `None` waits indefinitely (until a record arrives or the cursor dies).
    fn next_timeout(&mut self, timeout: Option<Duration>) -> Result<TailNext>;

    /// False once the cursor has died. Dead cursors never revive.
    fn is_alive(&self) -> bool;
}

/// Result of pulling from a [`TailCursor`].
#[derive(Debug)]
pub enum TailNext {
    Message(Message),
    /// The caller's timeout elapsed. The cursor is still usable.
    TimedOut,
    /// The cursor died and must be reopened.
    Dead,
}

/// Which records a scan matches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TailFilter {
    /// Only this topic (None = all topics).
    pub topic: Option<String>,
    /// Only records currently in this status (None = any status).
    pub status: Option<Status>,
    /// Only records with a sequence strictly greater than this.
    pub after: Sequence,
}

impl TailFilter {
    /// Pending records of `topic` after `after`.
    pub fn pending(topic: impl Into<String>, after: Sequence) -> Self {
        Self {
            topic: Some(topic.into()),
            status: Some(Status::Pending),
            after,
        }
    }

    /// Every record of `topic`.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Default::default()
        }
    }

    /// Every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, message: &Message) -> bool {
        if message.sequence <= self.after {
            return false;
        }

        if let Some(ref topic) = self.topic {
            if *topic != message.topic {
                return false;
            }
        }

        if let Some(status) = self.status {
            if status != message.status {
                return false;
            }
        }

        true
    }
}

/// Log names double as directory names in [`FileStore`], so keep them plain.
pub(crate) fn validate_log_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(TransportError::Configuration(format!(
            "invalid log name: {name:?}"
        )))
    }
}

/// Reject options a capped log cannot work with.
pub(crate) fn validate_options(options: &LogOptions) -> Result<()> {
    if let Some(capacity) = options.capacity {
        if capacity.bytes == 0 || capacity.max_entries == Some(0) {
            return Err(TransportError::Configuration(
                "capacity must allow at least one record".into(),
            ));
        }
    }
    Ok(())
}
