//! Deterministic in-memory collaborators.
//!
//! Scriptable stand-ins for the backend seams, used by this crate's own
//! tests and usable by downstream crates that embed the pipeline and want
//! deterministic tests without a live backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{BulkClient, BulkItemResult, BulkRequest, RefreshListener, RetryDecider};
use crate::error::{BackendFailure, TransportError};
use crate::registry::FailureRecord;

/// Scripted outcome for one bulk call.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Every item in the call succeeds.
    Succeed,
    /// The whole call fails at the transport level.
    Transport(TransportError),
    /// Requests whose document id matches fail with the given backend
    /// failure; the rest succeed.
    FailDoc(String, BackendFailure),
    /// Explicit per-item results. Must match the request count, which the
    /// scripter has to know in advance.
    Explicit(Vec<BulkItemResult>),
}

/// Bulk client driven by a script of per-call outcomes.
///
/// Outcomes are consumed front to back, one per call; once the script runs
/// dry every call succeeds. Every request list is recorded for inspection.
#[derive(Debug, Default)]
pub struct ScriptedBulkClient {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    calls: Mutex<Vec<Vec<BulkRequest>>>,
}

impl ScriptedBulkClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append one outcome to the script.
    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().push_back(outcome);
    }

    /// Append the same outcome several times.
    pub fn push_n(&self, outcome: ScriptedOutcome, times: usize) {
        let mut script = self.script.lock();
        for _ in 0..times {
            script.push_back(outcome.clone());
        }
    }

    /// Every request list this client has executed, in call order.
    pub fn calls(&self) -> Vec<Vec<BulkRequest>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl BulkClient for ScriptedBulkClient {
    async fn execute(&self, requests: &[BulkRequest]) -> Result<Vec<BulkItemResult>, TransportError> {
        self.calls.lock().push(requests.to_vec());
        let outcome = self.script.lock().pop_front().unwrap_or(ScriptedOutcome::Succeed);
        match outcome {
            ScriptedOutcome::Succeed => Ok(vec![Ok(()); requests.len()]),
            ScriptedOutcome::Transport(err) => Err(err),
            ScriptedOutcome::FailDoc(doc_id, failure) => Ok(requests
                .iter()
                .map(|request| {
                    if request.doc_id == doc_id {
                        Err(failure.clone())
                    } else {
                        Ok(())
                    }
                })
                .collect()),
            ScriptedOutcome::Explicit(results) => Ok(results),
        }
    }
}

/// Refresh listener that records every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingRefreshListener {
    refreshed: Mutex<Vec<Vec<String>>>,
}

impl RecordingRefreshListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every index list this listener was notified with, in call order.
    pub fn refreshed(&self) -> Vec<Vec<String>> {
        self.refreshed.lock().clone()
    }
}

#[async_trait]
impl RefreshListener for RecordingRefreshListener {
    async fn refresh(&self, indexes: &[String]) {
        self.refreshed.lock().push(indexes.to_vec());
    }
}

/// Retry decider driven by a script of decisions.
///
/// Decisions are consumed front to back, one per consultation; once the
/// script runs dry the default decision applies.
#[derive(Debug)]
pub struct ScriptedRetryDecider {
    script: Mutex<VecDeque<bool>>,
    default_decision: bool,
    consultations: AtomicUsize,
}

impl ScriptedRetryDecider {
    pub fn new(default_decision: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            default_decision,
            consultations: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, decision: bool) {
        self.script.lock().push_back(decision);
    }

    /// How many times the pipeline has consulted this decider.
    pub fn consultations(&self) -> usize {
        self.consultations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetryDecider for ScriptedRetryDecider {
    async fn should_retry(&self, _record: &FailureRecord) -> bool {
        self.consultations.fetch_add(1, Ordering::SeqCst);
        self.script.lock().pop_front().unwrap_or(self.default_decision)
    }
}
