//! Tracking reconciliation and retry engine for reverse-logistics requests.
//!
//! This crate keeps stored requests in step with the postal provider and
//! tells requesters when their shipment reaches a final outcome.
//!
//! # Architecture
//!
//! Three jobs run on independent intervals from the [`scheduler`]:
//!
//! 1. **Tracking poll** - pages through `Used` requests, sends one batched
//!    tracking query per page, and moves requests with a conclusive latest
//!    event to `Delivered` or `FailedDelivery`
//! 2. **Retry pass** - retries errored requests below the retry ceiling and
//!    escalates those at the ceiling to their requester
//! 3. **Follow-up** - applies reverse-operation updates pushed by the
//!    provider for collect and postage requests
//!
//! Provider retries and requester callbacks run on a bounded [`pool::TaskPool`]
//! so a slow provider or requester never stalls a run, and shutdown drains
//! them instead of dropping them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use postback_reconcile::{
//!     client::CallbackClient, provider::mock::MockProvider,
//!     storage::mock::MockRequestStorage, ReconcileConfig, ReconcileEngine, ReconcileError,
//! };
//!
//! # async fn example() -> std::result::Result<(), ReconcileError> {
//! let engine = ReconcileEngine::new(
//!     ReconcileConfig::default(),
//!     Arc::new(MockRequestStorage::new()),
//!     Arc::new(MockProvider::new()),
//!     Arc::new(CallbackClient::with_defaults()?),
//! )?;
//!
//! let summary = engine.poll_used_requests(0, 50).await?;
//! println!("delivered: {}", summary.delivered);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod classify;
pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod poller;
pub mod pool;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod storage;

pub use engine::{ReconcileConfig, ReconcileEngine};
pub use error::{ReconcileError, Result};
pub use poller::PollSummary;
pub use retry::RetrySummary;
pub use scheduler::{ScheduleConfig, Scheduler};

/// Default retry ceiling for errored requests.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Highest accepted retry ceiling.
///
/// Escalation stores `max_retries + 1`, which must stay representable.
pub const MAX_RETRY_CEILING: i32 = 1_000;

/// Default number of requests per tracking page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Default callback request timeout in seconds.
pub const DEFAULT_NOTIFICATION_TIMEOUT_SECONDS: u64 = 10;

/// Default number of retries and callbacks running at once.
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 16;

/// Default deadline in seconds for a single retry or callback task.
pub const DEFAULT_TASK_TIMEOUT_SECONDS: u64 = 60;
