//! # Capped Transport
//!
//! A topic-based message transport on top of a capacity-bounded,
//! append-only log.
//!
//! ## Core Concepts
//!
//! - **Log**: Ordered records with store-assigned sequences; the oldest are
//!   evicted silently once the byte or entry capacity is exceeded
//! - **Publishing**: Appends a `Pending` record to a topic
//! - **Subscriptions**: Tail a topic and claim each record with a conditional
//!   `Pending -> Processed` update, so concurrent subscribers never share one
//! - **Stores**: Pluggable backing stores; in-memory and journaled on disk
//!
//! ## Example
//!
//! ```ignore
//! use capped_transport::{MemoryStore, Transport, TransportConfig};
//!
//! let transport = Transport::open(MemoryStore::new(), TransportConfig::default())?;
//!
//! // Subscriptions only see messages published after they were created
//! let mut sub = transport.subscribe("orders")?;
//!
//! transport.publish("orders", &json!({"id": 1}))?;
//!
//! let msg = sub.recv()?;
//! let order: serde_json::Value = msg.decode()?;
//! ```

pub mod error;
pub mod log;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use error::{Result, TransportError};
pub use log::{
    FileStore, FileStoreConfig, LogStore, MemoryStore, MemoryStoreConfig, OrderedLog, RingCursor,
    RingLog, TailCursor, TailFilter, TailNext,
};
pub use subscriptions::{
    EmptyLogPolicy, StartFrom, Subscription, SubscriptionConfig, SubscriptionHandle,
};
pub use transport::{Transport, TransportConfig};
pub use types::*;
