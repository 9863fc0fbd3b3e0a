//! Transport tying a capped log to publishers and subscriptions.

use crate::error::{Result, TransportError};
use crate::log::{LogStore, OrderedLog, TailFilter};
use crate::subscriptions::{Subscription, SubscriptionConfig};
use crate::types::{
    Capacity, LogOptions, LogStats, Message, MessageInput, Outcome, Sequence, Status, Timestamp,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Transport configuration.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Name of the capped log.
    pub name: String,

    /// Capacity the log is created with (and must already have).
    pub capacity: Capacity,

    /// Defaults for `Transport::subscribe`.
    pub subscription: SubscriptionConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "msg_transport".to_string(),
            capacity: Capacity::default(),
            subscription: SubscriptionConfig::default(),
        }
    }
}

/// Topic-based message transport over one capped log.
///
/// Provides a unified interface for:
/// - Publishing messages to a topic
/// - Subscribing to a topic with exactly-one-claimer delivery
/// - Resetting the log
pub struct Transport<S: LogStore> {
    store: S,
    config: TransportConfig,
    /// Current log. Replaced by `clear`; None if `clear` could not recreate it.
    log: RwLock<Option<Arc<S::Log>>>,
}

impl<S: LogStore> Transport<S> {
    /// Open the configured log, creating it if missing.
    ///
    /// Fails with `Configuration` if a log of that name exists but is not
    /// capped, or is capped with a different capacity.
    pub fn open(store: S, config: TransportConfig) -> Result<Self> {
        let options = LogOptions::capped(config.capacity);

        let log = match store.log_options(&config.name)? {
            Some(existing) if !existing.is_capped() => {
                return Err(TransportError::Configuration(format!(
                    "log {} exists but is not capped",
                    config.name
                )));
            }
            Some(existing) if existing != options => {
                return Err(TransportError::Configuration(format!(
                    "log {} exists with capacity {:?}, configured {:?}",
                    config.name, existing.capacity, config.capacity
                )));
            }
            Some(_) => {
                let log = store.create_log(&config.name, options)?;
                info!(log = %config.name, "using log");
                log
            }
            None => {
                let log = store.create_log(&config.name, options)?;
                info!(log = %config.name, capacity = ?config.capacity, "log created");
                log
            }
        };

        Ok(Self {
            store,
            config,
            log: RwLock::new(Some(log)),
        })
    }

    // --- Publishing ---

    /// Publish a JSON-encoded message.
    pub fn publish(&self, topic: &str, data: &impl Serialize) -> Result<Message> {
        self.publish_input(MessageInput::json(topic, data)?)
    }

    /// Publish a MessagePack-encoded message.
    pub fn publish_msgpack(&self, topic: &str, data: &impl Serialize) -> Result<Message> {
        self.publish_input(MessageInput::msgpack(topic, data)?)
    }

    /// Publish raw bytes.
    pub fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<Message> {
        self.publish_input(MessageInput::raw(topic, payload))
    }

    /// Publish a prepared message. May evict the oldest messages.
    pub fn publish_input(&self, input: MessageInput) -> Result<Message> {
        self.current()?.append(input)
    }

    // --- Subscribing ---

    /// Subscribe to a topic with the configured defaults.
    pub fn subscribe(&self, topic: &str) -> Result<Subscription<S::Log>> {
        self.subscribe_with(topic, &self.config.subscription)
    }

    /// Subscribe to a topic with explicit options.
    pub fn subscribe_with(
        &self,
        topic: &str,
        config: &SubscriptionConfig,
    ) -> Result<Subscription<S::Log>> {
        Subscription::new(self.current()?, topic, config)
    }

    /// Record the consumer's outcome for a claimed message.
    ///
    /// Returns false if the message is not `Processed` (already acknowledged,
    /// never claimed, or evicted).
    pub fn acknowledge(&self, sequence: Sequence, outcome: Outcome) -> Result<bool> {
        let modified = self.current()?.transition(
            sequence,
            Status::Processed,
            outcome.into(),
            Timestamp::now(),
        )?;
        Ok(modified == 1)
    }

    // --- Inspection ---

    /// Look up a retained message.
    pub fn get(&self, sequence: Sequence) -> Result<Option<Message>> {
        self.current()?.get(sequence)
    }

    /// Retained messages of a topic nobody has claimed yet.
    pub fn pending(&self, topic: &str) -> Result<Vec<Message>> {
        self.current()?.find(&TailFilter::pending(topic, Sequence::ZERO))
    }

    pub fn stats(&self) -> Result<LogStats> {
        self.current()?.stats()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn capacity(&self) -> Capacity {
        self.config.capacity
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // --- Lifecycle ---

    /// Drop and recreate the log with the same capacity.
    ///
    /// Every existing subscription is dead afterwards: its next fetch fails
    /// with `StoreUnavailable`. Subscribe again to use the new log.
    ///
    /// If the log is dropped but cannot be recreated, the error is returned
    /// and the next operation on the transport tries to create it again.
    pub fn clear(&self) -> Result<()> {
        let mut log = self.log.write();

        self.store.drop_log(&self.config.name)?;
        *log = None;
        info!(log = %self.config.name, "log dropped");

        *log = Some(self.create()?);
        Ok(())
    }

    fn create(&self) -> Result<Arc<S::Log>> {
        let log = self
            .store
            .create_log(&self.config.name, LogOptions::capped(self.config.capacity))?;
        info!(log = %self.config.name, capacity = ?self.config.capacity, "log created");
        Ok(log)
    }

    fn current(&self) -> Result<Arc<S::Log>> {
        if let Some(log) = self.log.read().as_ref() {
            return Ok(Arc::clone(log));
        }

        let mut slot = self.log.write();
        match slot.as_ref() {
            Some(log) => Ok(Arc::clone(log)),
            None => {
                let log = self.create()?;
                *slot = Some(Arc::clone(&log));
                Ok(log)
            }
        }
    }
}
