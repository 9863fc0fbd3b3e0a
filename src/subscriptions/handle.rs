//! Subscription running on its own thread.

use super::cursor::Subscription;
use crate::error::{Result, TransportError};
use crate::log::OrderedLog;
use crate::types::Message;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// How often the worker checks whether it was asked to stop.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to a subscription running on a worker thread.
///
/// The worker claims records and forwards them over a bounded channel; it
/// stops claiming while the channel is full. Dropping the handle asks the
/// worker to stop and returns immediately. A record the worker had claimed
/// but not yet handed over at that moment is not redelivered.
pub struct SubscriptionHandle {
    topic: String,
    /// Channel to receive claimed records.
    receiver: Option<Receiver<Message>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl SubscriptionHandle {
    pub(crate) fn spawn<L: OrderedLog>(
        mut subscription: Subscription<L>,
        buffer_size: usize,
    ) -> Result<Self> {
        let (sender, receiver) = bounded(buffer_size);
        let stop = Arc::new(AtomicBool::new(false));
        let topic = subscription.topic().to_string();

        let worker = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("subscription-{topic}"))
                .spawn(move || -> Result<()> {
                    while !stop.load(Ordering::Acquire) {
                        let Some(message) = subscription.recv_timeout(STOP_POLL_INTERVAL)? else {
                            continue;
                        };
                        if sender.send(message).is_err() {
                            break;
                        }
                    }
                    debug!(topic = %subscription.topic(), "subscription worker stopped");
                    Ok(())
                })?
        };

        Ok(Self {
            topic,
            receiver: Some(receiver),
            stop,
            worker: Some(worker),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next record (blocking).
    pub fn recv(&self) -> std::result::Result<Message, crossbeam_channel::RecvError> {
        match self.receiver {
            Some(ref receiver) => receiver.recv(),
            None => Err(crossbeam_channel::RecvError),
        }
    }

    /// Try to receive a record (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<Message, crossbeam_channel::TryRecvError> {
        match self.receiver {
            Some(ref receiver) => receiver.try_recv(),
            None => Err(crossbeam_channel::TryRecvError::Disconnected),
        }
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Message, crossbeam_channel::RecvTimeoutError> {
        match self.receiver {
            Some(ref receiver) => receiver.recv_timeout(timeout),
            None => Err(crossbeam_channel::RecvTimeoutError::Disconnected),
        }
    }

    /// Stop the worker and wait for it.
    ///
    /// Returns the error that ended the worker, if any (for example
    /// `StoreUnavailable` after the log was cleared).
    pub fn close(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        // Unblocks a worker waiting on a full channel.
        self.receiver = None;

        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| TransportError::WorkerPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
