//! Penstock: a bounded, batched write pipeline for bulk-oriented backends.
//!
//! Sits between a data layer producing many independent point mutations and
//! a backend whose efficient write path is a bulk API. Producers enqueue
//! mutations from any thread; the pipeline accumulates them into count- and
//! byte-bounded batches, runs the bulk calls through a bounded worker pool,
//! retries per-item failures with exponential backoff, and requeues whole
//! batches on transport failures. A blocking [`drain`] gives callers
//! read-after-write consistency when they need it.
//!
//! [`drain`]: BatchCoordinator::drain
//!
//! ```
//! use penstock::{BatchCoordinator, BulkAction, MutationTarget, PipelineConfig};
//! use penstock::testing::ScriptedBulkClient;
//!
//! # async fn demo() -> Result<(), penstock::PipelineError> {
//! let client = ScriptedBulkClient::new();
//! let pipeline = BatchCoordinator::new(PipelineConfig::default(), client)?;
//!
//! let _handle = pipeline.enqueue(
//!     MutationTarget::new("people", "ada"),
//!     BulkAction::Update {
//!         document: serde_json::json!({ "name": "Ada Lovelace" }),
//!     },
//! );
//!
//! pipeline.drain().await?;
//! # Ok(())
//! # }
//! ```
//!
//! All pipeline state is in memory; this is not a durable queue, and it does
//! not order mutations for the same target relative to each other.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod item;
pub mod queue;
pub mod registry;
pub mod size;
pub mod testing;

mod coordinator_proptest;

pub use backend::{AlwaysRetry, BulkClient, BulkItemResult, BulkRequest, NoopRefresh, RefreshListener, RetryDecider};
pub use config::{ConfigError, PipelineConfig};
pub use coordinator::{BatchCoordinator, PipelineStats};
pub use error::{BackendFailure, FailureKind, PipelineError, TransportError};
pub use item::{BulkAction, ItemHandle, ItemOutcome, MutationItem, MutationTarget};
pub use registry::{BatchCompletion, FailureRecord, BASE_RETRY_DELAY};
pub use size::estimated_size;
