/// Single-slot handoff between the consumer loop and requesters
///
/// The consumer loop offers one entry at a time; a requester takes it. The
/// offer only completes once a requester has actually taken the entry, which
/// is what lets the loop acknowledge an entry strictly after delivery.
///
/// # Protocol
///
/// ```text
/// consumer loop                         requester
///   offer(entry, stop)                    take(wait)
///     ├─ slot = Some(entry)                 ├─ closed?           -> Closed
///     ├─ wake one taker                     ├─ slot.take()       -> Item
///     └─ wait until                         └─ wait until
///          slot empty   -> Accepted             offered          -> retry
///          stop fired   -> reclaim slot         closed           -> Closed
///                          Some -> Stopped      wait elapsed     -> TimedOut
///                          None -> Accepted
/// ```
///
/// The slot is the only place an entry lives while in flight, and both sides
/// move it in or out under the same lock, so an entry is either taken by
/// exactly one requester or handed back to the loop. Never both.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of an offer
#[derive(Debug, PartialEq, Eq)]
pub enum Offer<T> {
    /// A requester took the item
    Accepted,

    /// Stop was signalled before any requester took the item
    Stopped(T),
}

/// Outcome of a take
#[derive(Debug, PartialEq, Eq)]
pub enum Take<T> {
    /// Received an item
    Item(T),

    /// Nothing was offered within the wait
    TimedOut,

    /// The handoff was closed
    Closed,
}

/// Single-slot rendezvous
#[derive(Debug)]
pub struct Handoff<T> {
    /// The in-flight item
    slot: Mutex<Option<T>>,

    /// Signalled when an item is placed in the slot
    offered: Notify,

    /// Signalled when a taker empties the slot
    taken: Notify,

    /// Cancelled on close
    closed: CancellationToken,
}

impl<T> Handoff<T> {
    /// Creates an open, empty handoff
    pub fn new() -> Self {
        Handoff {
            slot: Mutex::new(None),
            offered: Notify::new(),
            taken: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<T>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offers an item and waits until it is taken or `stop` fires
    ///
    /// Only one offer may be in flight at a time; the consumer loop is the
    /// sole producer. If `stop` fires while the item is still in the slot the
    /// item is handed back in [`Offer::Stopped`]. If a requester took it in
    /// the meantime the offer counts as accepted.
    pub async fn offer(&self, item: T, stop: &CancellationToken) -> Offer<T> {
        *self.slot() = Some(item);
        self.offered.notify_one();

        loop {
            let taken = self.taken.notified();
            tokio::pin!(taken);
            taken.as_mut().enable();

            if self.slot().is_none() {
                return Offer::Accepted;
            }

            tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    return match self.slot().take() {
                        Some(item) => Offer::Stopped(item),
                        None => Offer::Accepted,
                    };
                }
                _ = &mut taken => {}
            }
        }
    }

    /// Waits up to `wait` for an offered item
    pub async fn take(&self, wait: Duration) -> Take<T> {
        let deadline = Instant::now() + wait;

        loop {
            let offered = self.offered.notified();
            tokio::pin!(offered);
            offered.as_mut().enable();

            if self.closed.is_cancelled() {
                return Take::Closed;
            }

            let item = self.slot().take();
            if let Some(item) = item {
                self.taken.notify_one();
                return Take::Item(item);
            }

            tokio::select! {
                biased;

                _ = self.closed.cancelled() => return Take::Closed,
                _ = &mut offered => {}
                _ = tokio::time::sleep_until(deadline) => return Take::TimedOut,
            }
        }
    }

    /// Closes the handoff
    ///
    /// Current and future takers observe [`Take::Closed`]. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the handoff was closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}
