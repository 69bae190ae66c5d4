//! Collaborator seams toward the backend.
//!
//! The pipeline never talks to the network itself. It hands assembled
//! batches to a [`BulkClient`], tells a [`RefreshListener`] which indexes a
//! completed batch touched, and consults a [`RetryDecider`] before putting a
//! failed item back on the queue.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{BackendFailure, TransportError};
use crate::item::{BulkAction, MutationItem};
use crate::registry::FailureRecord;

/// One entry of a bulk call, in backend terms.
#[derive(Debug, Clone, Serialize)]
pub struct BulkRequest {
    pub index: String,
    pub doc_id: String,
    pub action: BulkAction,
}

impl BulkRequest {
    pub(crate) fn from_item(item: &MutationItem) -> Self {
        Self {
            index: item.target().index.clone(),
            doc_id: item.target().doc_id.clone(),
            action: item.action().clone(),
        }
    }
}

/// Outcome of one item within a successful bulk response.
pub type BulkItemResult = Result<(), BackendFailure>;

/// Executes one bulk round-trip against the backend.
///
/// On success the returned results are aligned positionally with the input:
/// `results[i]` is the outcome of `requests[i]`. A [`TransportError`] means
/// the call as a whole failed and nothing is known about any item.
#[async_trait]
pub trait BulkClient: Send + Sync {
    async fn execute(&self, requests: &[BulkRequest]) -> Result<Vec<BulkItemResult>, TransportError>;
}

/// Notified with the distinct indexes touched by each completed batch, so an
/// index refresh can make the writes visible to subsequent reads.
#[async_trait]
pub trait RefreshListener: Send + Sync {
    async fn refresh(&self, indexes: &[String]);
}

/// Refresh listener that does nothing. The default for backends whose reads
/// do not need an explicit refresh signal.
#[derive(Debug, Default)]
pub struct NoopRefresh;

#[async_trait]
impl RefreshListener for NoopRefresh {
    async fn refresh(&self, _indexes: &[String]) {}
}

/// Decides whether a failed item should be retried once its backoff window
/// has elapsed. Implementations may resolve the failure out of band first,
/// for example by re-reading a conflicting version.
#[async_trait]
pub trait RetryDecider: Send + Sync {
    async fn should_retry(&self, record: &FailureRecord) -> bool;
}

/// Retry decider that always retries. The default policy; items still stop
/// retrying once their fail count reaches the configured maximum.
#[derive(Debug, Default)]
pub struct AlwaysRetry;

#[async_trait]
impl RetryDecider for AlwaysRetry {
    async fn should_retry(&self, _record: &FailureRecord) -> bool {
        true
    }
}
