//! Subscription configuration.

use crate::types::Sequence;

/// Configuration for a subscription.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionConfig {
    /// Where the watermark starts.
    /// Default: `StartFrom::Latest`
    pub start: StartFrom,

    /// What `StartFrom::Latest` does when the log holds no record.
    /// Default: `EmptyLogPolicy::Sentinel`
    pub empty_log: EmptyLogPolicy,
}

impl SubscriptionConfig {
    /// Only messages published after the subscription is created.
    pub fn latest() -> Self {
        Self::default()
    }

    /// Every retained pending message, oldest first.
    pub fn earliest() -> Self {
        Self {
            start: StartFrom::Earliest,
            ..Default::default()
        }
    }

    /// Messages after a watermark saved by an earlier subscription.
    pub fn after(sequence: Sequence) -> Self {
        Self {
            start: StartFrom::After(sequence),
            ..Default::default()
        }
    }
}

/// Initial watermark of a subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartFrom {
    /// The most recently appended record in the log, across all topics.
    #[default]
    Latest,
    /// Before every record.
    Earliest,
    /// A given sequence.
    After(Sequence),
}

/// Behaviour of `StartFrom::Latest` against an empty log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmptyLogPolicy {
    /// Start before every record. An empty log has no backlog to leak.
    #[default]
    Sentinel,
    /// Fail with `TransportError::EmptyLog`.
    Fail,
}
