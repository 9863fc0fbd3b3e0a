//! Capacity-bounded ring of records.
//!
//! `RingLog` is the engine behind both stores: an ordered deque of records
//! with byte and entry accounting, oldest-first eviction, conditional status
//! updates and blocking tail cursors. When a journal is attached every change
//! is written to it before it is applied in memory.

use super::journal::{Journal, JournalEntry};
use super::{OrderedLog, TailCursor, TailFilter, TailNext};
use crate::error::{Result, TransportError};
use crate::types::{
    Capacity, LogOptions, LogStats, Message, MessageInput, Sequence, Status, Timestamp,
};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Journal attached to a persistent ring.
struct Persistence {
    journal: Journal,
    /// Minimum size before the journal is rewritten.
    compact_min_bytes: u64,
    /// Rewrite once the journal grows past this.
    compact_at: u64,
}

struct RingState {
    /// Retained records, oldest first, strictly increasing sequence.
    entries: VecDeque<Message>,
    /// Sum of `stored_size` over `entries`.
    bytes: u64,
    /// Last sequence assigned.
    last_sequence: Sequence,
    evicted: u64,
    lost: u64,
    /// Set when the log is destroyed.
    dropped: bool,
    /// Bumped to kill every open cursor.
    epoch: u64,
    persistence: Option<Persistence>,
}

impl RingState {
    fn empty() -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            last_sequence: Sequence::ZERO,
            evicted: 0,
            lost: 0,
            dropped: false,
            epoch: 0,
            persistence: None,
        }
    }

    fn position(&self, sequence: Sequence) -> Option<usize> {
        self.entries
            .binary_search_by_key(&sequence, |m| m.sequence)
            .ok()
    }

    fn push(&mut self, message: Message) {
        self.bytes += message.stored_size();
        self.last_sequence = self.last_sequence.max(message.sequence);
        self.entries.push_back(message);
    }

    fn over_capacity(&self, capacity: &Capacity) -> bool {
        self.bytes > capacity.bytes
            || capacity
                .max_entries
                .map_or(false, |max| self.entries.len() as u64 > max)
    }

    /// Drop oldest records until the ring fits its capacity.
    fn evict(&mut self, capacity: &Capacity, log: &str) {
        while self.over_capacity(capacity) {
            let Some(old) = self.entries.pop_front() else {
                break;
            };
            self.bytes -= old.stored_size();
            self.evicted += 1;
            if old.status == Status::Pending {
                self.lost += 1;
            }
            trace!(log = %log, sequence = %old.sequence, status = ?old.status, "record evicted");
        }
    }

    /// Rewrite the journal once it has grown past its threshold.
    ///
    /// Runs after a change is committed, so a failure is logged and the
    /// change still stands. The threshold moves up either way.
    fn maybe_compact(&mut self, log: &str) {
        let RingState {
            entries,
            persistence,
            ..
        } = self;

        if let Some(p) = persistence {
            if p.journal.size() > p.compact_at {
                match p.journal.rewrite(entries.iter()) {
                    Ok(()) => debug!(
                        log = %log,
                        records = entries.len(),
                        bytes = p.journal.size(),
                        "journal compacted"
                    ),
                    Err(e) => warn!(
                        log = %log,
                        error = %e,
                        bytes = p.journal.size(),
                        "journal compaction failed"
                    ),
                }
                p.compact_at = p.compact_min_bytes.max(p.journal.size() * 2);
            }
        }
    }
}

fn apply_status(message: &mut Message, status: Status, at: Timestamp) {
    message.status = status;
    match status {
        Status::Processed => message.claimed_at = Some(at),
        Status::Success | Status::Failure => message.completed_at = Some(at),
        Status::Pending => {}
    }
}

/// A capacity-bounded, append-only log.
pub struct RingLog {
    name: String,
    options: LogOptions,
    state: Mutex<RingState>,
    /// Signalled on appends, status changes and anything that kills cursors.
    arrivals: Condvar,
    /// Shared with the owning store.
    store_closed: Arc<AtomicBool>,
    cursor_idle_timeout: Option<Duration>,
}

impl RingLog {
    /// Create an in-memory log.
    pub(crate) fn new(
        name: &str,
        options: LogOptions,
        store_closed: Arc<AtomicBool>,
        cursor_idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.to_string(),
            options,
            state: Mutex::new(RingState::empty()),
            arrivals: Condvar::new(),
            store_closed,
            cursor_idle_timeout,
        }
    }

    /// Create a journaled log, rebuilding its contents from `replay`.
    pub(crate) fn with_journal(
        name: &str,
        options: LogOptions,
        store_closed: Arc<AtomicBool>,
        cursor_idle_timeout: Option<Duration>,
        journal: Journal,
        replay: Vec<JournalEntry>,
        compact_min_bytes: u64,
    ) -> Self {
        let mut state = RingState::empty();

        for entry in replay {
            match entry {
                JournalEntry::Append(message) => {
                    if message.sequence <= state.last_sequence {
                        continue;
                    }
                    state.push(message);
                    if let Some(capacity) = options.capacity {
                        state.evict(&capacity, name);
                    }
                }
                JournalEntry::Status {
                    sequence,
                    status,
                    at,
                } => {
                    if let Some(index) = state.position(sequence) {
                        apply_status(&mut state.entries[index], status, at);
                    }
                }
            }
        }

        // Statistics cover this process only.
        state.evicted = 0;
        state.lost = 0;

        let base = options
            .capacity
            .map_or(compact_min_bytes, |c| compact_min_bytes.max(c.bytes * 2));
        state.persistence = Some(Persistence {
            compact_at: base.max(journal.size() * 2),
            compact_min_bytes: base,
            journal,
        });

        Self {
            name: name.to_string(),
            options,
            state: Mutex::new(state),
            arrivals: Condvar::new(),
            store_closed,
            cursor_idle_timeout,
        }
    }

    fn check_available(&self, state: &RingState) -> Result<()> {
        if state.dropped {
            return Err(TransportError::StoreUnavailable(format!(
                "log {} was dropped",
                self.name
            )));
        }
        if self.store_closed.load(Ordering::Acquire) {
            return Err(TransportError::StoreUnavailable("store is closed".into()));
        }
        Ok(())
    }

    /// Kill every open cursor on this log.
    ///
    /// Cursors report `TailNext::Dead` on their next pull, as they would when
    /// the store drops them on its own.
    pub fn invalidate_cursors(&self) {
        self.state.lock().epoch += 1;
        self.arrivals.notify_all();
    }

    /// Force journaled writes to disk. No-op for in-memory logs.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(p) = state.persistence.as_mut() {
            p.journal.sync()?;
        }
        Ok(())
    }

    /// Destroy contents and kill cursors. Closes the journal file.
    pub(crate) fn mark_dropped(&self) {
        {
            let mut state = self.state.lock();
            state.dropped = true;
            state.entries.clear();
            state.bytes = 0;
            state.persistence = None;
        }
        self.arrivals.notify_all();
    }

    /// Wake all waiting cursors so they notice the store closing.
    pub(crate) fn wake_all(&self) {
        // Taking the lock orders the wakeup after any waiter's liveness check.
        drop(self.state.lock());
        self.arrivals.notify_all();
    }
}

impl OrderedLog for RingLog {
    type Cursor = RingCursor;

    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> &LogOptions {
        &self.options
    }

    fn append(&self, input: MessageInput) -> Result<Message> {
        if let Some(capacity) = self.options.capacity {
            let size = input.stored_size();
            if size > capacity.bytes {
                return Err(TransportError::RecordTooLarge {
                    size,
                    capacity: capacity.bytes,
                });
            }
        }

        let mut guard = self.state.lock();
        self.check_available(&guard)?;
        let state = &mut *guard;

        let message = Message {
            sequence: state.last_sequence.next(),
            topic: input.topic,
            status: Status::Pending,
            published_at: Timestamp::now(),
            claimed_at: None,
            completed_at: None,
            payload: input.payload,
            encoding: input.encoding,
        };

        if let Some(p) = state.persistence.as_mut() {
            p.journal.append(&JournalEntry::Append(message.clone()))?;
        }

        state.push(message.clone());
        if let Some(capacity) = self.options.capacity {
            state.evict(&capacity, &self.name);
        }
        state.maybe_compact(&self.name);

        drop(guard);
        self.arrivals.notify_all();

        Ok(message)
    }

    fn last(&self) -> Result<Option<Message>> {
        let state = self.state.lock();
        self.check_available(&state)?;
        Ok(state.entries.back().cloned())
    }

    fn get(&self, sequence: Sequence) -> Result<Option<Message>> {
        let state = self.state.lock();
        self.check_available(&state)?;
        Ok(state.position(sequence).map(|i| state.entries[i].clone()))
    }

    fn find(&self, filter: &TailFilter) -> Result<Vec<Message>> {
        let state = self.state.lock();
        self.check_available(&state)?;
        let start = state.entries.partition_point(|m| m.sequence <= filter.after);
        Ok(state
            .entries
            .range(start..)
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    fn tail(self: &Arc<Self>, filter: TailFilter) -> Result<RingCursor> {
        let state = self.state.lock();
        self.check_available(&state)?;

        Ok(RingCursor {
            log: Arc::clone(self),
            position: filter.after,
            filter,
            last_returned: None,
            epoch: state.epoch,
            alive: true,
        })
    }

    fn transition(
        &self,
        sequence: Sequence,
        from: Status,
        to: Status,
        at: Timestamp,
    ) -> Result<u64> {
        if !from.can_transition_to(to) {
            return Err(TransportError::InvalidTransition { from, to });
        }

        let mut guard = self.state.lock();
        self.check_available(&guard)?;
        let state = &mut *guard;

        let Some(index) = state.position(sequence) else {
            return Ok(0);
        };
        if state.entries[index].status != from {
            return Ok(0);
        }

        if let Some(p) = state.persistence.as_mut() {
            p.journal.append(&JournalEntry::Status {
                sequence,
                status: to,
                at,
            })?;
        }
        apply_status(&mut state.entries[index], to, at);
        state.maybe_compact(&self.name);

        drop(guard);
        self.arrivals.notify_all();

        Ok(1)
    }

    fn stats(&self) -> Result<LogStats> {
        let state = self.state.lock();
        self.check_available(&state)?;
        Ok(LogStats {
            entries: state.entries.len() as u64,
            bytes: state.bytes,
            last_sequence: state.last_sequence,
            evicted: state.evicted,
            lost: state.lost,
        })
    }
}

/// Blocking scan over a [`RingLog`].
pub struct RingCursor {
    log: Arc<RingLog>,
    filter: TailFilter,
    /// Records at or before this sequence have been examined.
    position: Sequence,
    /// Last record handed out. The cursor dies once it is evicted.
    last_returned: Option<Sequence>,
    epoch: u64,
    alive: bool,
}

impl RingCursor {
    /// Records the cursor has examined so far.
    pub fn position(&self) -> Sequence {
        self.position
    }

    fn died(&self, state: &RingState) -> bool {
        if state.dropped || self.log.store_closed.load(Ordering::Acquire) {
            return true;
        }
        if state.epoch != self.epoch {
            return true;
        }
        match (self.last_returned, state.entries.front()) {
            (Some(last), Some(front)) => front.sequence > last,
            _ => false,
        }
    }

    /// Skipping non-matching records is only safe when none of them can
    /// start matching later. Statuses never return to `Pending`.
    fn may_skip_ahead(&self) -> bool {
        matches!(self.filter.status, None | Some(Status::Pending))
    }
}

impl TailCursor for RingCursor {
    fn next_timeout(&mut self, timeout: Option<Duration>) -> Result<TailNext> {
        if !self.alive {
            return Ok(TailNext::Dead);
        }

        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let idle_deadline = self.log.cursor_idle_timeout.map(|t| started + t);

        let log = Arc::clone(&self.log);
        let mut state = log.state.lock();

        loop {
            if self.died(&state) {
                self.alive = false;
                debug!(log = %log.name, position = %self.position, "tail cursor died");
                return Ok(TailNext::Dead);
            }

            let start = state.entries.partition_point(|m| m.sequence <= self.position);
            if let Some(message) = state
                .entries
                .range(start..)
                .find(|m| self.filter.matches(m))
            {
                self.position = message.sequence;
                self.last_returned = Some(message.sequence);
                return Ok(TailNext::Message(message.clone()));
            }

            if self.may_skip_ahead() {
                self.position = self.position.max(state.last_sequence);
            }

            let now = Instant::now();
            if deadline.map_or(false, |d| now >= d) {
                return Ok(TailNext::TimedOut);
            }
            if idle_deadline.map_or(false, |d| now >= d) {
                self.alive = false;
                debug!(log = %log.name, position = %self.position, "tail cursor idle timeout");
                return Ok(TailNext::Dead);
            }

            let wake_at = match (deadline, idle_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match wake_at {
                Some(at) => {
                    log.arrivals.wait_until(&mut state, at);
                }
                None => log.arrivals.wait(&mut state),
            }
        }
    }

    fn is_alive(&self) -> bool {
        if !self.alive {
            return false;
        }
        let state = self.log.state.lock();
        !self.died(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ring(capacity: Option<Capacity>) -> Arc<RingLog> {
        Arc::new(RingLog::new(
            "test",
            LogOptions { capacity },
            Arc::new(AtomicBool::new(false)),
            None,
        ))
    }

    fn publish(log: &RingLog, topic: &str, n: u64) -> Message {
        log.append(MessageInput::raw(topic, n.to_le_bytes().to_vec()))
            .unwrap()
    }

    #[test]
    fn test_sequences_are_strictly_increasing() {
        let log = ring(None);
        let a = publish(&log, "a", 1);
        let b = publish(&log, "b", 2);
        let c = publish(&log, "a", 3);

        assert_eq!(a.sequence, Sequence(1));
        assert_eq!(b.sequence, Sequence(2));
        assert_eq!(c.sequence, Sequence(3));
        assert_eq!(a.status, Status::Pending);
        assert_eq!(log.last().unwrap().unwrap().sequence, Sequence(3));
    }

    #[test]
    fn test_evicts_by_entry_count() {
        let log = ring(Some(Capacity::new(1 << 20, Some(3))));
        for i in 0..5 {
            publish(&log, "t", i);
        }

        let retained: Vec<_> = log
            .find(&TailFilter::all())
            .unwrap()
            .into_iter()
            .map(|m| m.sequence.0)
            .collect();
        assert_eq!(retained, vec![3, 4, 5]);

        let stats = log.stats().unwrap();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evicted, 2);
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.last_sequence, Sequence(5));
    }

    #[test]
    fn test_evicts_by_bytes() {
        // Each record is overhead + 1 (topic) + 8 (payload) bytes.
        let per_record = crate::types::RECORD_OVERHEAD + 9;
        let log = ring(Some(Capacity::new(per_record * 2, None)));
        for i in 0..4 {
            publish(&log, "t", i);
        }

        let stats = log.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, per_record * 2);
        assert!(log.get(Sequence(2)).unwrap().is_none());
        assert!(log.get(Sequence(3)).unwrap().is_some());
    }

    #[test]
    fn test_claimed_records_are_not_counted_lost() {
        let log = ring(Some(Capacity::new(1 << 20, Some(1))));
        let first = publish(&log, "t", 0);
        log.transition(first.sequence, Status::Pending, Status::Processed, Timestamp::now())
            .unwrap();
        publish(&log, "t", 1);

        let stats = log.stats().unwrap();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.lost, 0);
    }

    #[test]
    fn test_record_too_large() {
        let log = ring(Some(Capacity::new(64, None)));
        let result = log.append(MessageInput::raw("t", vec![0u8; 64]));
        assert!(matches!(result, Err(TransportError::RecordTooLarge { .. })));
        assert_eq!(log.stats().unwrap().last_sequence, Sequence::ZERO);
    }

    #[test]
    fn test_transition_is_conditional() {
        let log = ring(None);
        let msg = publish(&log, "t", 0);
        let at = Timestamp::now();

        assert_eq!(
            log.transition(msg.sequence, Status::Pending, Status::Processed, at)
                .unwrap(),
            1
        );
        assert_eq!(
            log.transition(msg.sequence, Status::Pending, Status::Processed, at)
                .unwrap(),
            0
        );
        assert_eq!(
            log.transition(Sequence(99), Status::Pending, Status::Processed, at)
                .unwrap(),
            0
        );

        let stored = log.get(msg.sequence).unwrap().unwrap();
        assert_eq!(stored.status, Status::Processed);
        assert_eq!(stored.claimed_at, Some(at));

        assert!(matches!(
            log.transition(msg.sequence, Status::Processed, Status::Pending, at),
            Err(TransportError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_tail_returns_matching_in_order() {
        let log = ring(None);
        publish(&log, "a", 0);
        publish(&log, "b", 1);
        publish(&log, "a", 2);

        let mut cursor = log.tail(TailFilter::pending("a", Sequence::ZERO)).unwrap();
        let mut seen = Vec::new();
        while let TailNext::Message(m) = cursor.next_timeout(Some(Duration::ZERO)).unwrap() {
            seen.push(m.sequence.0);
        }
        assert_eq!(seen, vec![1, 3]);
        assert!(cursor.is_alive());
    }

    #[test]
    fn test_tail_blocks_until_append() {
        let log = ring(None);
        let mut cursor = log.tail(TailFilter::pending("t", Sequence::ZERO)).unwrap();

        let writer = {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                publish(&log, "t", 7);
            })
        };

        match cursor.next_timeout(Some(Duration::from_secs(5))).unwrap() {
            TailNext::Message(m) => assert_eq!(m.sequence, Sequence(1)),
            other => panic!("Expected message, got {:?}", other),
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_tail_timeout_keeps_cursor_alive() {
        let log = ring(None);
        let mut cursor = log.tail(TailFilter::pending("t", Sequence::ZERO)).unwrap();

        let next = cursor.next_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(matches!(next, TailNext::TimedOut));
        assert!(cursor.is_alive());

        publish(&log, "t", 0);
        assert!(matches!(
            cursor.next_timeout(Some(Duration::ZERO)).unwrap(),
            TailNext::Message(_)
        ));
    }

    #[test]
    fn test_tail_dies_when_position_evicted() {
        let log = ring(Some(Capacity::new(1 << 20, Some(2))));
        publish(&log, "t", 0);

        let mut cursor = log.tail(TailFilter::pending("t", Sequence::ZERO)).unwrap();
        assert!(matches!(
            cursor.next_timeout(Some(Duration::ZERO)).unwrap(),
            TailNext::Message(_)
        ));

        publish(&log, "t", 1);
        publish(&log, "t", 2);

        assert!(matches!(
            cursor.next_timeout(Some(Duration::ZERO)).unwrap(),
            TailNext::Dead
        ));
        assert!(!cursor.is_alive());
    }

    #[test]
    fn test_invalidate_kills_waiting_cursor() {
        let log = ring(None);
        let mut cursor = log.tail(TailFilter::pending("t", Sequence::ZERO)).unwrap();

        let killer = {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                log.invalidate_cursors();
            })
        };

        assert!(matches!(
            cursor.next_timeout(Some(Duration::from_secs(5))).unwrap(),
            TailNext::Dead
        ));
        killer.join().unwrap();

        // New cursors are unaffected.
        let mut fresh = log.tail(TailFilter::pending("t", Sequence::ZERO)).unwrap();
        publish(&log, "t", 0);
        assert!(matches!(
            fresh.next_timeout(Some(Duration::ZERO)).unwrap(),
            TailNext::Message(_)
        ));
    }

    #[test]
    fn test_idle_timeout_kills_cursor() {
        let log = Arc::new(RingLog::new(
            "idle",
            LogOptions::uncapped(),
            Arc::new(AtomicBool::new(false)),
            Some(Duration::from_millis(20)),
        ));
        let mut cursor = log.tail(TailFilter::pending("t", Sequence::ZERO)).unwrap();

        assert!(matches!(cursor.next_timeout(None).unwrap(), TailNext::Dead));
    }

    #[test]
    fn test_dropped_log_is_unavailable() {
        let log = ring(None);
        publish(&log, "t", 0);
        let mut cursor = log.tail(TailFilter::pending("t", Sequence::ZERO)).unwrap();

        log.mark_dropped();

        assert!(matches!(
            cursor.next_timeout(Some(Duration::ZERO)).unwrap(),
            TailNext::Dead
        ));
        assert!(matches!(
            log.append(MessageInput::raw("t", vec![])),
            Err(TransportError::StoreUnavailable(_))
        ));
        assert!(matches!(
            log.tail(TailFilter::all()),
            Err(TransportError::StoreUnavailable(_))
        ));
    }
}
