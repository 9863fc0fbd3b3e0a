//! Core types for the transport.

use crate::error::{Result, TransportError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position in the log, assigned by the store at append time.
///
/// Sequences are unique and strictly increasing across every topic of a log.
/// `Sequence::ZERO` is never assigned and sorts before every record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Lifecycle of a message.
///
/// Transitions only move forward: `Pending -> Processed -> {Success, Failure}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Published, not yet claimed by any subscriber.
    Pending,
    /// Claimed by exactly one subscriber.
    Processed,
    /// Acknowledged as handled by the consumer.
    Success,
    /// Acknowledged as failed by the consumer.
    Failure,
}

impl Status {
    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Pending, Status::Processed)
                | (Status::Processed, Status::Success)
                | (Status::Processed, Status::Failure)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failure)
    }
}

/// Consumer-side result of handling a claimed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl From<Outcome> for Status {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Status::Success,
            Outcome::Failure => Status::Failure,
        }
    }
}

/// Payload encoding format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PayloadEncoding {
    #[default]
    Json,
    MessagePack,
    Raw,
}

/// Fixed per-record bookkeeping charged against the byte capacity.
pub const RECORD_OVERHEAD: u64 = 48;

/// A single message in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the log (assigned by store).
    pub sequence: Sequence,

    /// Logical stream this message belongs to.
    pub topic: String,

    /// Where the message is in its lifecycle.
    pub status: Status,

    /// When the message was appended.
    pub published_at: Timestamp,

    /// When a subscriber claimed the message.
    pub claimed_at: Option<Timestamp>,

    /// When the consumer acknowledged the message.
    pub completed_at: Option<Timestamp>,

    /// Opaque payload.
    pub payload: Vec<u8>,

    /// Payload encoding.
    pub encoding: PayloadEncoding,
}

impl Message {
    /// Bytes this message is charged against a log's byte capacity.
    pub fn stored_size(&self) -> u64 {
        RECORD_OVERHEAD + self.topic.len() as u64 + self.payload.len() as u64
    }

    /// Decode a JSON or MessagePack payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self.encoding {
            PayloadEncoding::Json => serde_json::from_slice(&self.payload)
                .map_err(|e| TransportError::Deserialization(e.to_string())),
            PayloadEncoding::MessagePack => Ok(rmp_serde::from_slice(&self.payload)?),
            PayloadEncoding::Raw => Err(TransportError::Deserialization(
                "raw payloads carry no encoding".into(),
            )),
        }
    }
}

/// Input for publishing a message (before sequence and status are assigned).
#[derive(Clone, Debug)]
pub struct MessageInput {
    pub topic: String,
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
}

impl MessageInput {
    /// Create a message input with a JSON payload.
    pub fn json(topic: impl Into<String>, data: &impl Serialize) -> Result<Self> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_vec(data)?,
            encoding: PayloadEncoding::Json,
        })
    }

    /// Create a message input with a MessagePack payload.
    pub fn msgpack(topic: impl Into<String>, data: &impl Serialize) -> Result<Self> {
        Ok(Self {
            topic: topic.into(),
            payload: rmp_serde::to_vec_named(data)?,
            encoding: PayloadEncoding::MessagePack,
        })
    }

    /// Create a message input with raw bytes.
    pub fn raw(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            encoding: PayloadEncoding::Raw,
        }
    }

    /// Bytes the resulting message will be charged.
    pub fn stored_size(&self) -> u64 {
        RECORD_OVERHEAD + self.topic.len() as u64 + self.payload.len() as u64
    }
}

/// Size limits of a capped log. Whichever bound is hit first evicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Max total bytes (see `Message::stored_size`).
    pub bytes: u64,
    /// Max number of records (None = bytes only).
    pub max_entries: Option<u64>,
}

impl Capacity {
    pub fn new(bytes: u64, max_entries: Option<u64>) -> Self {
        Self { bytes, max_entries }
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            bytes: 5 * 1024 * 1024, // 5MB
            max_entries: Some(5000),
        }
    }
}

/// Options a log was created with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Capacity bounds (None = not capped, never evicts).
    pub capacity: Option<Capacity>,
}

impl LogOptions {
    pub fn capped(capacity: Capacity) -> Self {
        Self {
            capacity: Some(capacity),
        }
    }

    pub fn uncapped() -> Self {
        Self { capacity: None }
    }

    pub fn is_capped(&self) -> bool {
        self.capacity.is_some()
    }
}

/// Point-in-time statistics of a log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Records currently retained.
    pub entries: u64,
    /// Bytes currently charged against capacity.
    pub bytes: u64,
    /// Last sequence ever assigned.
    pub last_sequence: Sequence,
    /// Records evicted to make room.
    pub evicted: u64,
    /// Evicted records that were still pending (never claimed).
    pub lost: u64,
}
