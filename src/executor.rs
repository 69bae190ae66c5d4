//! Bounded worker pool executing bulk calls.
//!
//! A bounded mpsc channel feeds a fixed set of long-lived worker tasks.
//! `submit` awaits channel capacity, so once enough batches are queued or in
//! flight, further submission blocks. That blocking is the pipeline's only
//! throttle; nothing is ever silently dropped. Each job performs exactly one
//! network round-trip under the configured per-call timeout.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::{BulkClient, BulkItemResult, BulkRequest};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, TransportError};

/// Result of one bulk call as delivered back to the coordinator.
pub(crate) type BulkCallResult = Result<Vec<BulkItemResult>, TransportError>;

struct BatchJob {
    requests: Vec<BulkRequest>,
    result_tx: oneshot::Sender<BulkCallResult>,
}

/// Owns the worker pool and the bounded work queue in front of it.
pub struct BulkExecutor {
    tx: mpsc::Sender<BatchJob>,
    workers: Vec<JoinHandle<()>>,
}

impl BulkExecutor {
    /// Spawn the worker pool. Workers run until the executor is dropped and
    /// the work queue drains; in-flight calls are never cancelled.
    pub fn new(client: Arc<dyn BulkClient>, config: &PipelineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        let call_timeout = config.call_timeout;

        let workers = (0..config.pool_max_size)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let client = Arc::clone(&client);
                tokio::spawn(worker_loop(worker_id, rx, client, call_timeout))
            })
            .collect();

        Self { tx, workers }
    }

    /// Queue one bulk call. Blocks while the work queue is at capacity and
    /// returns the receiver the call's outcome will be delivered on.
    pub async fn submit(&self, requests: Vec<BulkRequest>) -> Result<oneshot::Receiver<BulkCallResult>, PipelineError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(BatchJob { requests, result_tx })
            .await
            .map_err(|_| PipelineError::ExecutorClosed)?;
        Ok(result_rx)
    }

    /// Stop accepting work and wait for the workers to finish what they
    /// already picked up.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

impl std::fmt::Debug for BulkExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkExecutor").field("workers", &self.workers.len()).finish()
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<BatchJob>>>,
    client: Arc<dyn BulkClient>,
    call_timeout: std::time::Duration,
) {
    loop {
        // Hold the receiver lock only while waiting for the next job, so the
        // other workers can pick up work while this one runs its call.
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            debug!(worker_id, "bulk worker shutting down");
            break;
        };

        let count = job.requests.len();
        let outcome = match tokio::time::timeout(call_timeout, client.execute(&job.requests)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(worker_id, count, timeout_ms = call_timeout.as_millis() as u64, "bulk call timed out");
                Err(TransportError::TimedOut {
                    timeout_ms: call_timeout.as_millis() as u64,
                })
            }
        };

        if job.result_tx.send(outcome).is_err() {
            warn!(worker_id, count, "bulk call finished but nobody was waiting for the result");
        }
    }
}
