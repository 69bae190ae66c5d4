//! The single pending write and its completion signals.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::BackendFailure;
use crate::size::{estimated_size, SCALAR_COST};

/// Identity of the entity a mutation applies to: the backend index (or
/// table) holding the document, and the document's id within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationTarget {
    pub index: String,
    pub doc_id: String,
}

impl MutationTarget {
    pub fn new(index: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            doc_id: doc_id.into(),
        }
    }
}

impl std::fmt::Display for MutationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.doc_id)
    }
}

/// The backend action carried by a mutation.
///
/// Produced by the caller's mutation-translation layer; the pipeline treats
/// the document tree as opaque and only reads it to estimate payload size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum BulkAction {
    /// Write (or overwrite) the document for the target.
    Update { document: Value },
    /// Remove the target's document.
    Delete,
}

impl BulkAction {
    /// Estimated payload cost, computed once at item construction.
    fn payload_size(&self) -> usize {
        match self {
            BulkAction::Update { document } => estimated_size(document),
            BulkAction::Delete => SCALAR_COST,
        }
    }
}

/// Terminal outcome of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The backend applied the mutation.
    Applied,
    /// The mutation was permanently dropped after repeated backend failures
    /// or a negative retry decision. Carries the last failure seen.
    Dropped { failure: BackendFailure },
}

/// Receivers handed back from `enqueue`.
///
/// `admitted` resolves when the item is placed into a batch; `completed`
/// resolves with the item's terminal outcome. Both may be dropped by callers
/// that do not care.
#[derive(Debug)]
pub struct ItemHandle {
    pub admitted: oneshot::Receiver<()>,
    pub completed: oneshot::Receiver<ItemOutcome>,
}

/// A single pending write.
///
/// Immutable after construction except for `last_tried`, `fail_count`, and
/// the two take-once completion senders. Items are shared between the
/// pipeline's collections as `Arc<MutationItem>`; identity is the allocation,
/// not the target, since one target can have several pending mutations.
#[derive(Debug)]
pub struct MutationItem {
    id: Uuid,
    target: MutationTarget,
    action: BulkAction,
    size_bytes: usize,
    created_at: Instant,
    last_tried: Mutex<Instant>,
    fail_count: AtomicU32,
    admitted_tx: Mutex<Option<oneshot::Sender<()>>>,
    completed_tx: Mutex<Option<oneshot::Sender<ItemOutcome>>>,
}

impl MutationItem {
    /// Build an item and the caller-facing handle to its signals.
    pub fn new(target: MutationTarget, action: BulkAction) -> (std::sync::Arc<Self>, ItemHandle) {
        let (admitted_tx, admitted) = oneshot::channel();
        let (completed_tx, completed) = oneshot::channel();
        let now = Instant::now();
        let size_bytes = action.payload_size();
        let item = std::sync::Arc::new(Self {
            id: Uuid::new_v4(),
            target,
            action,
            size_bytes,
            created_at: now,
            last_tried: Mutex::new(now),
            fail_count: AtomicU32::new(0),
            admitted_tx: Mutex::new(Some(admitted_tx)),
            completed_tx: Mutex::new(Some(completed_tx)),
        });
        (item, ItemHandle { admitted, completed })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &MutationTarget {
        &self.target
    }

    pub fn action(&self) -> &BulkAction {
        &self.action
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_tried(&self) -> Instant {
        *self.last_tried.lock()
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::SeqCst)
    }

    /// Advance `last_tried` to now. Called whenever the item re-enters the
    /// todo queue or moves into a batch.
    pub(crate) fn touch(&self) {
        *self.last_tried.lock() = Instant::now();
    }

    /// Record one backend-reported failure and return the new count.
    pub(crate) fn record_failure(&self) -> u32 {
        self.fail_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resolve the admitted signal. Idempotent; later calls are no-ops.
    pub(crate) fn mark_admitted(&self) {
        if let Some(tx) = self.admitted_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Resolve the terminal signal. Idempotent; later calls are no-ops.
    pub(crate) fn complete(&self, outcome: ItemOutcome) {
        if let Some(tx) = self.completed_tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn size_is_computed_at_construction() {
        let (item, _handle) = MutationItem::new(
            MutationTarget::new("people", "p1"),
            BulkAction::Update {
                document: json!("aaaaaaaaaa"),
            },
        );
        assert_eq!(item.size_bytes(), 10);

        let (delete, _handle) = MutationItem::new(MutationTarget::new("people", "p2"), BulkAction::Delete);
        assert_eq!(delete.size_bytes(), SCALAR_COST);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_advances_last_tried_only() {
        let (item, _handle) = MutationItem::new(MutationTarget::new("people", "p1"), BulkAction::Delete);
        let created = item.created_at();
        tokio::time::advance(std::time::Duration::from_millis(100)).await;
        item.touch();
        assert_eq!(item.created_at(), created);
        assert!(item.last_tried() > created);
    }

    #[tokio::test]
    async fn fail_count_is_monotonic() {
        let (item, _handle) = MutationItem::new(MutationTarget::new("people", "p1"), BulkAction::Delete);
        assert_eq!(item.fail_count(), 0);
        assert_eq!(item.record_failure(), 1);
        assert_eq!(item.record_failure(), 2);
        assert_eq!(item.fail_count(), 2);
    }

    #[tokio::test]
    async fn signals_resolve_once() {
        let (item, handle) = MutationItem::new(MutationTarget::new("people", "p1"), BulkAction::Delete);
        item.mark_admitted();
        item.mark_admitted();
        handle.admitted.await.expect("admitted signal");

        item.complete(ItemOutcome::Applied);
        item.complete(ItemOutcome::Dropped {
            failure: BackendFailure::rejected("late"),
        });
        assert_eq!(handle.completed.await.unwrap(), ItemOutcome::Applied);
    }

    #[tokio::test]
    async fn dropped_handle_does_not_poison_the_item() {
        let (item, handle) = MutationItem::new(MutationTarget::new("people", "p1"), BulkAction::Delete);
        drop(handle);
        item.mark_admitted();
        item.complete(ItemOutcome::Applied);
    }
}
