/// In-memory stream store.
///
/// Mirrors the Redis stream semantics the worker relies on: append-only
/// entries with increasing IDs, consumer groups that start at the end of the
/// stream, `>` reads that mark entries pending for a consumer, acknowledgement,
/// and approximate MAXLEN trimming. Blocking reads wake up when an entry is
/// added.
///
/// It also exposes inspection helpers (pending lists, stream contents) and
/// fault knobs (slow adds, failing reads and acks) for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::store::{Fields, StoreError, StreamEntry, StreamStore};

/// A delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Stream entry ID
    pub id: String,
    /// Consumer the entry was delivered to
    pub consumer: String,
    /// Number of times the entry was delivered
    pub deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Sequence of the last entry delivered through `>`.
    last_delivered: u64,
    /// Pending entries keyed by sequence.
    pending: BTreeMap<u64, (String, u32)>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: VecDeque<(u64, Fields)>,
    last_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamState>,
    closed: bool,
}

/// In-memory [`StreamStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    added: Notify,
    add_delay: Mutex<Duration>,
    failing_reads: AtomicUsize,
    failing_acks: AtomicUsize,
}

fn format_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_id(id: &str) -> Option<u64> {
    id.split_once('-').map_or(id, |(ms, _)| ms).parse().ok()
}

fn consume_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryStore {
    /// Creates an empty, open store with no streams.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Delays every subsequent `add` by `delay`.
    pub fn set_add_delay(&self, delay: Duration) {
        *self
            .add_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    /// Makes the next `n` group reads fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` acknowledgements fail.
    pub fn fail_next_acks(&self, n: usize) {
        self.failing_acks.store(n, Ordering::SeqCst);
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of entries currently in the stream.
    pub fn len(&self, stream: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    /// Whether the stream holds no entries.
    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// All entries currently in the stream, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.lock()
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(seq, fields)| StreamEntry::new(format_id(*seq), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The group's pending list, oldest first.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<PendingEntry> {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(seq, (consumer, deliveries))| PendingEntry {
                        id: format_id(*seq),
                        consumer: consumer.clone(),
                        deliveries: *deliveries,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transfers pending entries to `consumer` (XCLAIM without idle filtering).
    ///
    /// Returns the claimed entries that still exist in the stream.
    pub fn claim(&self, stream: &str, group: &str, consumer: &str, ids: &[&str]) -> Vec<StreamEntry> {
        let mut state = self.lock();
        let Some(s) = state.streams.get_mut(stream) else {
            return Vec::new();
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Vec::new();
        };

        let mut claimed = Vec::new();
        for seq in ids.iter().filter_map(|id| parse_id(id)) {
            if let Some((owner, deliveries)) = g.pending.get_mut(&seq) {
                *owner = consumer.to_string();
                *deliveries += 1;
                if let Some((_, fields)) = s.entries.iter().find(|(n, _)| *n == seq) {
                    claimed.push(StreamEntry::new(format_id(seq), fields.clone()));
                }
            }
        }
        claimed
    }

    /// Delivers up to `count` new entries, or None when there are none yet.
    fn deliver(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Option<Vec<StreamEntry>>, StoreError> {
        let mut state = self.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }

        let no_group = || {
            StoreError::Command(format!(
                "NOGROUP No such key '{}' or consumer group '{}'",
                stream, group
            ))
        };
        let s = state.streams.get_mut(stream).ok_or_else(no_group)?;
        let g = s.groups.get_mut(group).ok_or_else(no_group)?;

        let batch: Vec<StreamEntry> = s
            .entries
            .iter()
            .filter(|(seq, _)| *seq > g.last_delivered)
            .take(count.max(1))
            .map(|(seq, fields)| StreamEntry::new(format_id(*seq), fields.clone()))
            .collect();

        if batch.is_empty() {
            return Ok(None);
        }

        for entry in &batch {
            if let Some(seq) = parse_id(&entry.id) {
                g.last_delivered = seq;
                g.pending.insert(seq, (consumer.to_string(), 1));
            }
        }

        Ok(Some(batch))
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }

        let s = state.streams.entry(stream.to_string()).or_default();
        let start = s.last_seq;
        s.groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: start,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        if consume_failure(&self.failing_reads) {
            return Err(StoreError::Connection("injected read failure".to_string()));
        }

        let deadline = Instant::now() + block;
        loop {
            let notified = self.added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(batch) = self.deliver(stream, group, consumer, count)? {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
        if consume_failure(&self.failing_acks) {
            return Err(StoreError::Connection("injected ack failure".to_string()));
        }

        let mut state = self.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }

        if let (Some(g), Some(seq)) = (
            state
                .streams
                .get_mut(stream)
                .and_then(|s| s.groups.get_mut(group)),
            parse_id(id),
        ) {
            g.pending.remove(&seq);
        }
        Ok(())
    }

    async fn add(
        &self,
        stream: &str,
        fields: &Fields,
        max_len: usize,
    ) -> Result<String, StoreError> {
        let delay = *self
            .add_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let id = {
            let mut state = self.lock();
            if state.closed {
                return Err(StoreError::Closed);
            }

            let s = state.streams.entry(stream.to_string()).or_default();
            s.last_seq += 1;
            let seq = s.last_seq;
            s.entries.push_back((seq, fields.clone()));

            if max_len > 0 {
                while s.entries.len() > max_len {
                    s.entries.pop_front();
                }
            }

            format_id(seq)
        };

        self.added.notify_waiters();
        Ok(id)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.lock().closed = true;
        self.added.notify_waiters();
    }
}
