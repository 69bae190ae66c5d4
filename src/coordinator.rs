//! The batching coordinator, heart of the pipeline.
//!
//! Producers enqueue mutations into the *todo* queue. The coordinator
//! assembles count- and byte-bounded batches from it, moves the selected
//! items to *submitted*, and hands each batch to the executor. When a bulk
//! call completes, the coordinator reconciles the queues:
//!
//! - a transport-level failure puts the whole batch back on *todo*
//!   unchanged, to be retried on the next cycle with no backoff
//! - a per-item backend failure increments that item's fail count and parks
//!   it for backoff-gated retry, dropping it for good at the maximum
//! - a success resolves the item's completion signal
//!
//! Batches for different targets run concurrently and complete in any
//! order. Mutations for the same target are not coalesced or ordered here;
//! producers that need same-target ordering must serialize their enqueues.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::backend::{AlwaysRetry, BulkClient, BulkRequest, NoopRefresh, RefreshListener, RetryDecider};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::executor::{BulkCallResult, BulkExecutor};
use crate::item::{BulkAction, ItemHandle, ItemOutcome, MutationItem, MutationTarget};
use crate::queue::ItemQueue;
use crate::registry::{BatchCompletion, FailureQueue, FailureRecord, InFlightRegistry};

/// Sleep applied when the pipeline is non-empty but there is momentarily
/// nothing to submit or wait on (a batch's outcome is being reconciled).
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Snapshot of the pipeline's queue depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Mutations awaiting batch selection.
    pub todo: usize,
    /// Mutations riding an in-flight batch.
    pub submitted: usize,
    /// Mutations parked for backoff-gated retry.
    pub failures: usize,
    /// Batches currently executing against the backend.
    pub in_flight_batches: usize,
}

impl PipelineStats {
    /// True when no mutation is pending anywhere in the pipeline.
    pub fn is_empty(&self) -> bool {
        self.todo == 0 && self.submitted == 0 && self.failures == 0 && self.in_flight_batches == 0
    }
}

/// Orchestrates batching, submission, completion handling, and retry.
///
/// Cheap to share: all public operations take `&self` or `&Arc<Self>`.
/// Producers may call [`enqueue`](Self::enqueue) from any thread with no
/// coordination; any number of [`flush`](Self::flush) and
/// [`drain`](Self::drain) calls may run concurrently.
pub struct BatchCoordinator {
    config: PipelineConfig,
    todo: ItemQueue,
    submitted: ItemQueue,
    failures: FailureQueue,
    in_flight: InFlightRegistry,
    executor: BulkExecutor,
    refresh: Arc<dyn RefreshListener>,
    retry: Arc<dyn RetryDecider>,
    /// Serializes batch selection so two concurrent selections can never
    /// assign the same item to two batches.
    selection: parking_lot::Mutex<()>,
    batch_seq: AtomicU64,
}

impl BatchCoordinator {
    /// Build a coordinator with the default collaborators: no refresh
    /// signalling and an always-retry policy.
    pub fn new(config: PipelineConfig, client: Arc<dyn BulkClient>) -> Result<Arc<Self>, PipelineError> {
        Self::with_collaborators(config, client, Arc::new(NoopRefresh), Arc::new(AlwaysRetry))
    }

    /// Build a coordinator with explicit refresh and retry collaborators.
    pub fn with_collaborators(
        config: PipelineConfig,
        client: Arc<dyn BulkClient>,
        refresh: Arc<dyn RefreshListener>,
        retry: Arc<dyn RetryDecider>,
    ) -> Result<Arc<Self>, PipelineError> {
        config.validate()?;
        let config = config.finalize();
        let executor = BulkExecutor::new(client, &config);
        Ok(Arc::new(Self {
            config,
            todo: ItemQueue::new("todo"),
            submitted: ItemQueue::new("submitted"),
            failures: FailureQueue::new(),
            in_flight: InFlightRegistry::new(),
            executor,
            refresh,
            retry,
            selection: parking_lot::Mutex::new(()),
            batch_seq: AtomicU64::new(0),
        }))
    }

    /// Queue one mutation. Never blocks.
    ///
    /// Relative ordering of two mutations for the same target is not
    /// guaranteed once both are in the pipeline; producers that need it
    /// must wait for the first to complete before enqueueing the second.
    pub fn enqueue(&self, target: MutationTarget, action: BulkAction) -> ItemHandle {
        let (item, handle) = MutationItem::new(target, action);
        debug!(item = %item.id(), target = %item.target(), bytes = item.size_bytes(), "enqueued mutation");
        self.todo.add(item);
        handle
    }

    /// Assemble one batch from the head of the todo queue.
    ///
    /// Runs as a single critical section. The head item is always admitted
    /// into an empty batch regardless of its size, so one oversized mutation
    /// cannot stall the pipeline; after that, items are admitted while the
    /// count stays within `max_batch_items` and the cumulative size within
    /// `max_batch_bytes`. Admitted items move to *submitted* and have their
    /// last-tried time advanced before this returns.
    pub(crate) fn select_batch(&self) -> Vec<Arc<MutationItem>> {
        let _guard = self.selection.lock();
        let mut batch = Vec::new();
        let mut batch_bytes = 0usize;

        while batch.len() < self.config.max_batch_items {
            let Some(head) = self.todo.peek_first() else {
                break;
            };
            if !batch.is_empty() && batch_bytes + head.size_bytes() > self.config.max_batch_bytes {
                break;
            }
            // Only this critical section dequeues from todo, so the head we
            // peeked is the head we take.
            let Some(item) = self.todo.dequeue_first() else {
                break;
            };
            item.touch();
            item.mark_admitted();
            batch_bytes += item.size_bytes();
            self.submitted.add(Arc::clone(&item));
            batch.push(item);
        }

        if !batch.is_empty() {
            debug!(items = batch.len(), bytes = batch_bytes, "selected batch");
        }
        batch
    }

    /// Select one batch and submit it to the executor.
    ///
    /// Returns a completion handle that resolves once the batch's outcome
    /// has been reconciled; an already-resolved handle if there was nothing
    /// to submit. Blocks while the executor's work queue is at capacity.
    pub async fn flush(self: &Arc<Self>) -> Result<BatchCompletion, PipelineError> {
        let batch = self.select_batch();
        if batch.is_empty() {
            return Ok(BatchCompletion::resolved());
        }

        let seq = self.batch_seq.fetch_add(1, Ordering::SeqCst);
        let requests: Vec<BulkRequest> = batch.iter().map(|item| BulkRequest::from_item(item)).collect();
        let (done_tx, completion) = BatchCompletion::channel();
        self.in_flight.insert(seq, batch.clone(), completion.clone());

        let result_rx = match self.executor.submit(requests).await {
            Ok(rx) => rx,
            Err(err) => {
                // The executor is gone; put the batch back so nothing is
                // stranded in *submitted*.
                self.in_flight.remove(seq);
                self.requeue_batch(&batch);
                let _ = done_tx.send(true);
                return Err(err);
            }
        };

        debug!(batch = seq, items = batch.len(), "submitted batch");
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match result_rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(crate::error::TransportError::Executor {
                    reason: "worker dropped the result channel".to_string(),
                }),
            };
            coordinator.handle_batch_outcome(seq, batch, outcome).await;
            let _ = done_tx.send(true);
        });

        Ok(completion)
    }

    /// Reconcile the queues with one batch's outcome.
    async fn handle_batch_outcome(&self, seq: u64, batch: Vec<Arc<MutationItem>>, outcome: BulkCallResult) {
        self.in_flight.remove(seq);

        let results = match outcome {
            Err(transport) => {
                warn!(batch = seq, items = batch.len(), error = %transport, "bulk call failed, requeueing batch");
                self.requeue_batch(&batch);
                return;
            }
            Ok(results) if results.len() != batch.len() => {
                warn!(
                    batch = seq,
                    items = batch.len(),
                    results = results.len(),
                    "bulk response is misaligned with the request, requeueing batch"
                );
                self.requeue_batch(&batch);
                return;
            }
            Ok(results) => results,
        };

        let mut touched_indexes = BTreeSet::new();
        for (item, result) in batch.into_iter().zip(results) {
            self.submitted.remove(&item);
            touched_indexes.insert(item.target().index.clone());

            match result {
                Ok(()) => item.complete(ItemOutcome::Applied),
                Err(failure) => {
                    let fail_count = item.record_failure();
                    if fail_count >= self.config.max_fail_count {
                        error!(
                            item = %item.id(),
                            target = %item.target(),
                            fail_count,
                            error = %failure,
                            "dropping mutation after repeated backend failures"
                        );
                        item.complete(ItemOutcome::Dropped { failure });
                    } else {
                        debug!(item = %item.id(), fail_count, error = %failure, "parking mutation for retry");
                        self.failures.add(FailureRecord { item, failure });
                    }
                }
            }
        }

        let touched_indexes: Vec<String> = touched_indexes.into_iter().collect();
        self.refresh.refresh(&touched_indexes).await;
    }

    /// Return a transport-failed batch to the todo queue, fail counts
    /// untouched.
    fn requeue_batch(&self, batch: &[Arc<MutationItem>]) {
        for item in batch {
            self.submitted.remove(item);
            item.touch();
            self.todo.add(Arc::clone(item));
        }
    }

    /// Re-dispatch every failed item whose backoff window has elapsed.
    ///
    /// Each due record is shown to the retry decider; accepted items return
    /// to the todo queue, declined ones are dropped for good.
    pub async fn handle_failures(&self) {
        let due = self.failures.take_due(Instant::now());
        for record in due {
            if self.retry.should_retry(&record).await {
                debug!(item = %record.item.id(), fail_count = record.item.fail_count(), "retrying failed mutation");
                record.item.touch();
                self.todo.add(Arc::clone(&record.item));
            } else {
                warn!(
                    item = %record.item.id(),
                    target = %record.item.target(),
                    error = %record.failure,
                    "retry decider dropped mutation"
                );
                record.item.complete(ItemOutcome::Dropped {
                    failure: record.failure,
                });
            }
        }
    }

    /// Block until the pipeline is completely empty.
    ///
    /// Due failures are handled before new batches are submitted, and new
    /// batches before waiting on in-flight ones, so the backlog cannot grow
    /// unboundedly while retries are pending. Returns successfully even if
    /// individual mutations were permanently dropped along the way; drops
    /// are observable through logging and each item's completion signal.
    pub async fn drain(self: &Arc<Self>) -> Result<(), PipelineError> {
        loop {
            if self.stats().is_empty() {
                return Ok(());
            }

            if self.failures.has_due(Instant::now()) {
                self.handle_failures().await;
            } else if !self.todo.is_empty() {
                self.flush().await?;
            } else if let Some(oldest) = self.in_flight.oldest() {
                oldest.wait().await;
            } else if let Some(due) = self.failures.earliest_due() {
                tokio::time::sleep_until(due).await;
            } else {
                tokio::time::sleep(IDLE_POLL).await;
            }
        }
    }

    /// Block until no pending or in-flight mutation references `doc_id`.
    ///
    /// Gives a caller read-after-write consistency for one entity without
    /// waiting for the whole pipeline to drain. Mutations parked in the
    /// failure queue are intentionally not waited on; they already missed
    /// their first attempt and will be retried on their own schedule.
    pub async fn drain_until_target_complete(self: &Arc<Self>, doc_id: &str) -> Result<(), PipelineError> {
        while self.contains_target(doc_id) {
            let completion = self.flush().await?;
            if completion.is_complete() {
                // Nothing selectable: the target rides a batch that is
                // already in flight. Wait for the oldest one to land.
                match self.in_flight.oldest() {
                    Some(oldest) => oldest.wait().await,
                    None => tokio::time::sleep(IDLE_POLL).await,
                }
            } else {
                completion.wait().await;
            }
        }
        Ok(())
    }

    /// Spawn an actor that periodically handles due failures and flushes
    /// queued mutations, so producers never have to call `flush` themselves.
    /// Abort the returned handle to stop it; a final `drain` then empties
    /// whatever is left.
    pub fn spawn_background_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let interval = self.config.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if coordinator.failures.has_due(Instant::now()) {
                    coordinator.handle_failures().await;
                }
                if !coordinator.todo.is_empty() {
                    if let Err(err) = coordinator.flush().await {
                        warn!(error = %err, "background flusher stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Whether any pending or in-flight mutation references `doc_id`.
    /// Mutations parked for retry or already terminal do not count.
    pub fn contains_target(&self, doc_id: &str) -> bool {
        self.todo.contains_target(doc_id) || self.submitted.contains_target(doc_id)
    }

    /// Creation time of the oldest mutation still pending or in flight.
    pub fn oldest_pending_created(&self) -> Option<Instant> {
        match (self.todo.oldest_created(), self.submitted.oldest_created()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// How many pending or in-flight mutations were created before `cutoff`.
    pub fn pending_created_before(&self, cutoff: Instant) -> usize {
        self.todo.count_created_before(cutoff) + self.submitted.count_created_before(cutoff)
    }

    /// Snapshot the queue depths.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            todo: self.todo.len(),
            submitted: self.submitted.len(),
            failures: self.failures.len(),
            in_flight_batches: self.in_flight.len(),
        }
    }

    #[cfg(test)]
    pub(crate) fn queues(&self) -> (&ItemQueue, &ItemQueue, &FailureQueue, &InFlightRegistry) {
        (&self.todo, &self.submitted, &self.failures, &self.in_flight)
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("stats", &self.stats())
            .field("config", &self.config)
            .finish()
    }
}
