//! Thread-safe FIFO queues of pending mutations.
//!
//! Two independent instances back the pipeline: `todo` (awaiting batch
//! selection) and `submitted` (riding an in-flight batch). Producers push
//! concurrently; the coordinator dequeues from the head. Read-only queries
//! take the read lock so they never contend with each other.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::item::MutationItem;

/// An ordered, thread-safe collection of pending mutations.
///
/// FIFO with respect to `add` order: `dequeue_first` removes the oldest
/// entry. Ordering is strict under a single dequeuer and best-effort when
/// several run concurrently.
pub struct ItemQueue {
    name: &'static str,
    items: RwLock<VecDeque<Arc<MutationItem>>>,
}

impl ItemQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: RwLock::new(VecDeque::new()),
        }
    }

    /// Name used in logs ("todo" / "submitted").
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an item at the tail.
    pub fn add(&self, item: Arc<MutationItem>) {
        self.items.write().push_back(item);
    }

    /// Remove a specific item, identified by allocation rather than target,
    /// since one target can have several pending mutations.
    pub fn remove(&self, item: &Arc<MutationItem>) -> bool {
        let mut items = self.items.write();
        match items.iter().position(|candidate| Arc::ptr_eq(candidate, item)) {
            Some(index) => {
                items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove and return the head, oldest first.
    pub fn dequeue_first(&self) -> Option<Arc<MutationItem>> {
        self.items.write().pop_front()
    }

    /// Return the head without removing it.
    pub fn peek_first(&self) -> Option<Arc<MutationItem>> {
        self.items.read().front().cloned()
    }

    /// Whether any queued mutation references the given document id.
    pub fn contains_target(&self, doc_id: &str) -> bool {
        self.items.read().iter().any(|item| item.target().doc_id == doc_id)
    }

    /// Creation time of the oldest queued mutation.
    pub fn oldest_created(&self) -> Option<Instant> {
        self.items.read().iter().map(|item| item.created_at()).min()
    }

    /// How many queued mutations were created before the given instant.
    pub fn count_created_before(&self, cutoff: Instant) -> usize {
        self.items.read().iter().filter(|item| item.created_at() < cutoff).count()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl std::fmt::Debug for ItemQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{BulkAction, MutationTarget};

    fn item(doc_id: &str) -> Arc<MutationItem> {
        MutationItem::new(MutationTarget::new("idx", doc_id), BulkAction::Delete).0
    }

    #[tokio::test]
    async fn dequeue_is_fifo() {
        let queue = ItemQueue::new("todo");
        let (a, b, c) = (item("a"), item("b"), item("c"));
        queue.add(a.clone());
        queue.add(b.clone());
        queue.add(c.clone());

        assert_eq!(queue.dequeue_first().unwrap().target().doc_id, "a");
        assert_eq!(queue.dequeue_first().unwrap().target().doc_id, "b");
        assert_eq!(queue.dequeue_first().unwrap().target().doc_id, "c");
        assert!(queue.dequeue_first().is_none());
    }

    #[tokio::test]
    async fn peek_does_not_remove() {
        let queue = ItemQueue::new("todo");
        queue.add(item("a"));
        assert_eq!(queue.peek_first().unwrap().target().doc_id, "a");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn remove_matches_by_identity_not_target() {
        let queue = ItemQueue::new("todo");
        let first = item("same");
        let second = item("same");
        queue.add(first.clone());
        queue.add(second.clone());

        assert!(queue.remove(&first));
        assert!(!queue.remove(&first));
        assert_eq!(queue.len(), 1);
        assert!(Arc::ptr_eq(&queue.peek_first().unwrap(), &second));
    }

    #[tokio::test]
    async fn contains_target_tracks_membership() {
        let queue = ItemQueue::new("todo");
        let tracked = item("watched");
        queue.add(tracked.clone());
        assert!(queue.contains_target("watched"));
        assert!(!queue.contains_target("other"));

        queue.remove(&tracked);
        assert!(!queue.contains_target("watched"));
    }

    #[tokio::test(start_paused = true)]
    async fn age_queries() {
        let queue = ItemQueue::new("todo");
        let old = item("old");
        tokio::time::advance(std::time::Duration::from_millis(50)).await;
        let cutoff = Instant::now();
        tokio::time::advance(std::time::Duration::from_millis(50)).await;
        let young = item("young");

        queue.add(young.clone());
        queue.add(old.clone());

        assert_eq!(queue.oldest_created(), Some(old.created_at()));
        assert_eq!(queue.count_created_before(cutoff), 1);
        tokio::time::advance(std::time::Duration::from_millis(1)).await;
        assert_eq!(queue.count_created_before(Instant::now()), 2);
    }

    #[tokio::test]
    async fn concurrent_adds_land_once_each() {
        let queue = Arc::new(ItemQueue::new("todo"));
        let mut handles = Vec::new();
        for producer in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    queue.add(item(&format!("p{}-{}", producer, i)));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(queue.len(), 200);
    }
}
