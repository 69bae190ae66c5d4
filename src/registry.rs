//! Registries for failed items awaiting retry and batches in flight.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::BackendFailure;
use crate::item::MutationItem;

/// Base delay for the exponential backoff window. The wait before retrying
/// a failed item is `BASE_RETRY_DELAY * 2^fail_count`.
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Exponent is capped so the multiplication cannot overflow; with the cap
/// the window tops out around eleven minutes.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Backoff window for an item that has failed `fail_count` times.
pub(crate) fn backoff_delay(fail_count: u32) -> Duration {
    BASE_RETRY_DELAY * 2u32.pow(fail_count.min(MAX_BACKOFF_SHIFT))
}

/// A mutation paired with the backend failure that set it aside.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub item: Arc<MutationItem>,
    pub failure: BackendFailure,
}

impl FailureRecord {
    /// Earliest instant at which this record may be retried.
    pub fn next_retry_at(&self) -> Instant {
        self.item.last_tried() + backoff_delay(self.item.fail_count())
    }
}

/// Holds per-item backend failures until their backoff window elapses.
#[derive(Debug, Default)]
pub struct FailureQueue {
    records: Mutex<Vec<FailureRecord>>,
}

impl FailureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: FailureRecord) {
        self.records.lock().push(record);
    }

    /// Remove and return every record whose backoff window has elapsed.
    pub fn take_due(&self, now: Instant) -> Vec<FailureRecord> {
        let mut records = self.records.lock();
        let mut due = Vec::new();
        let mut index = 0;
        while index < records.len() {
            if records[index].next_retry_at() <= now {
                due.push(records.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due
    }

    pub fn has_due(&self, now: Instant) -> bool {
        self.records.lock().iter().any(|record| record.next_retry_at() <= now)
    }

    /// Earliest retry time over all held records.
    pub fn earliest_due(&self) -> Option<Instant> {
        self.records.lock().iter().map(|record| record.next_retry_at()).min()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Multi-waiter completion handle for one in-flight batch.
///
/// Any number of waiters can block on `wait`; the coordinator resolves the
/// handle exactly once after the batch's outcome has been reconciled.
#[derive(Debug, Clone)]
pub struct BatchCompletion {
    rx: watch::Receiver<bool>,
}

impl BatchCompletion {
    pub(crate) fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// An already-resolved handle, returned when there was nothing to submit.
    pub(crate) fn resolved() -> Self {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Self { rx }
    }

    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    /// Block until the batch completes. Returns immediately if it already
    /// has, or if the pipeline was torn down mid-flight.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

struct InFlightBatch {
    items: Vec<Arc<MutationItem>>,
    completion: BatchCompletion,
}

/// The set of batches currently executing against the backend, keyed by a
/// monotonically increasing sequence number so the oldest is answerable.
#[derive(Default)]
pub struct InFlightRegistry {
    batches: Mutex<BTreeMap<u64, InFlightBatch>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, seq: u64, items: Vec<Arc<MutationItem>>, completion: BatchCompletion) {
        self.batches.lock().insert(seq, InFlightBatch { items, completion });
    }

    pub fn remove(&self, seq: u64) -> Option<Vec<Arc<MutationItem>>> {
        self.batches.lock().remove(&seq).map(|batch| batch.items)
    }

    /// Completion handle of the oldest batch still in flight.
    pub fn oldest(&self) -> Option<BatchCompletion> {
        let batches = self.batches.lock();
        batches.values().next().map(|batch| batch.completion.clone())
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

impl std::fmt::Debug for InFlightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{BulkAction, MutationTarget};

    fn record(doc_id: &str, failures: u32) -> FailureRecord {
        let (item, _handle) = MutationItem::new(MutationTarget::new("idx", doc_id), BulkAction::Delete);
        for _ in 0..failures {
            item.record_failure();
        }
        FailureRecord {
            item,
            failure: BackendFailure::conflict("stale version"),
        }
    }

    #[test]
    fn backoff_doubles_per_failure() {
        assert_eq!(backoff_delay(0), Duration::from_millis(10));
        assert_eq!(backoff_delay(1), Duration::from_millis(20));
        assert_eq!(backoff_delay(3), Duration::from_millis(80));
        // The exponent cap keeps the window finite.
        assert_eq!(backoff_delay(40), backoff_delay(MAX_BACKOFF_SHIFT));
    }

    #[tokio::test(start_paused = true)]
    async fn take_due_respects_the_window() {
        let queue = FailureQueue::new();
        queue.add(record("one-failure", 1));

        assert!(!queue.has_due(Instant::now()));
        assert!(queue.take_due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(21)).await;
        assert!(queue.has_due(Instant::now()));
        let due = queue.take_due(Instant::now());
        assert_eq!(due.len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_due_picks_the_lowest_fail_count() {
        let queue = FailureQueue::new();
        queue.add(record("slow", 4));
        queue.add(record("fast", 1));

        let earliest = queue.earliest_due().unwrap();
        assert_eq!(earliest, Instant::now() + Duration::from_millis(20));
    }

    #[tokio::test]
    async fn completion_resolves_all_waiters() {
        let (tx, completion) = BatchCompletion::channel();
        assert!(!completion.is_complete());

        let waiter_a = completion.clone();
        let waiter_b = completion.clone();
        let a = tokio::spawn(async move { waiter_a.wait().await });
        let b = tokio::spawn(async move { waiter_b.wait().await });

        tx.send(true).unwrap();
        a.await.unwrap();
        b.await.unwrap();
        assert!(completion.is_complete());
    }

    #[tokio::test]
    async fn resolved_completion_never_blocks() {
        BatchCompletion::resolved().wait().await;
    }

    #[tokio::test]
    async fn registry_orders_by_sequence() {
        let registry = InFlightRegistry::new();
        let (_tx1, first) = BatchCompletion::channel();
        let (tx2, second) = BatchCompletion::channel();
        registry.insert(1, Vec::new(), first);
        registry.insert(2, Vec::new(), second);

        let oldest = registry.oldest().unwrap();
        assert!(!oldest.is_complete());
        tx2.send(true).unwrap();
        // Resolving the newer batch leaves the oldest handle untouched.
        assert!(!registry.oldest().unwrap().is_complete());

        registry.remove(1);
        assert!(registry.oldest().unwrap().is_complete());
    }
}
