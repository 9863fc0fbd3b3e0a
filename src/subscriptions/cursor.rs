//! Claiming subscription over a topic.

use super::config::{EmptyLogPolicy, StartFrom, SubscriptionConfig};
use super::handle::SubscriptionHandle;
use crate::error::{Result, TransportError};
use crate::log::{OrderedLog, TailCursor, TailFilter, TailNext};
use crate::types::{Message, Sequence, Status, Timestamp};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// A single consumer's view of a topic.
///
/// Each record handed out has been claimed (`Pending -> Processed`) by this
/// subscription and no other. Any number of subscriptions may run against the
/// same topic concurrently; one subscription must not be shared.
///
/// The watermark is the sequence of the last claimed record. It only lives
/// here, and every tail cursor is opened from it, so a cursor that dies is
/// replaced without skipping or repeating records.
pub struct Subscription<L: OrderedLog> {
    log: Arc<L>,
    topic: String,
    watermark: Sequence,
    cursor: Option<L::Cursor>,
    reopens: u64,
    /// Set once the iterator has yielded an error.
    failed: bool,
}

impl<L: OrderedLog> Subscription<L> {
    /// Create a subscription, seeding the watermark per `config`.
    pub fn new(log: Arc<L>, topic: impl Into<String>, config: &SubscriptionConfig) -> Result<Self> {
        let topic = topic.into();

        let watermark = match config.start {
            StartFrom::Earliest => Sequence::ZERO,
            StartFrom::After(sequence) => sequence,
            StartFrom::Latest => match log.last()? {
                Some(last) => last.sequence,
                None => match config.empty_log {
                    EmptyLogPolicy::Sentinel => Sequence::ZERO,
                    EmptyLogPolicy::Fail => {
                        return Err(TransportError::EmptyLog(log.name().to_string()))
                    }
                },
            },
        };

        Ok(Self {
            log,
            topic,
            watermark,
            cursor: None,
            reopens: 0,
            failed: false,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Sequence of the last claimed record (or the starting point).
    pub fn watermark(&self) -> Sequence {
        self.watermark
    }

    /// How many times a tail cursor has been opened.
    pub fn reopen_count(&self) -> u64 {
        self.reopens
    }

    /// Block until a record is claimed.
    pub fn recv(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = self.fetch(None)? {
                return Ok(message);
            }
        }
    }

    /// Block until a record is claimed or `timeout` elapses.
    ///
    /// Returns `Ok(None)` on timeout. Nothing is claimed in that case and
    /// the subscription can be used again.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        self.fetch(Some(Instant::now() + timeout))
    }

    /// Move the subscription onto a worker thread that forwards claimed
    /// records over a channel of `buffer_size`.
    pub fn spawn(self, buffer_size: usize) -> Result<SubscriptionHandle> {
        SubscriptionHandle::spawn(self, buffer_size)
    }

    fn open_cursor(&mut self) -> Result<()> {
        let filter = TailFilter::pending(self.topic.clone(), self.watermark);
        self.cursor = Some(self.log.tail(filter)?);
        self.reopens += 1;
        info!(
            log = %self.log.name(),
            topic = %self.topic,
            watermark = %self.watermark,
            "tail cursor opened"
        );
        Ok(())
    }

    fn fetch(&mut self, deadline: Option<Instant>) -> Result<Option<Message>> {
        loop {
            let alive = self.cursor.as_ref().map_or(false, |c| c.is_alive());
            if !alive {
                self.open_cursor()?;
            }
            let Some(cursor) = self.cursor.as_mut() else {
                continue;
            };

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let mut message = match cursor.next_timeout(remaining)? {
                TailNext::Message(message) => message,
                TailNext::TimedOut => return Ok(None),
                TailNext::Dead => {
                    debug!(topic = %self.topic, watermark = %self.watermark, "tail cursor died");
                    self.cursor = None;
                    continue;
                }
            };

            if message.sequence <= self.watermark {
                continue;
            }

            let at = Timestamp::now();
            let claimed =
                self.log
                    .transition(message.sequence, Status::Pending, Status::Processed, at)?;
            if claimed != 1 {
                trace!(topic = %self.topic, sequence = %message.sequence, "claim lost");
                continue;
            }

            self.watermark = message.sequence;
            message.status = Status::Processed;
            message.claimed_at = Some(at);
            debug!(topic = %self.topic, sequence = %message.sequence, "message claimed");
            return Ok(Some(message));
        }
    }
}

impl<L: OrderedLog> Iterator for Subscription<L> {
    type Item = Result<Message>;

    /// Blocks until the next claimed record. Yields at most one error, then ends.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.recv() {
            Ok(message) => Some(Ok(message)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
