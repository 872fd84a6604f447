//! Reconciliation engine entry points.
//!
//! Wires storage, provider, and notifier to a shared task pool and exposes
//! the three jobs the scheduler runs: the tracking poll, the retry pass, and
//! the follow-up of reverse updates.

use std::{sync::Arc, time::Duration};

use postback_core::models::ReverseKind;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    client::Notifier,
    dispatcher::Dispatcher,
    error::{ErrorCategory, ReconcileError, Result},
    poller::{PollSummary, StatusPoller},
    pool::{PoolConfig, TaskPool},
    provider::{ProviderHandler, LANGUAGE_PORTUGUESE},
    retry::{ErrorReprocessor, RetrySummary},
    storage::RequestStorage,
};

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Retry ceiling for errored requests.
    pub max_retries: i32,
    /// Requests per tracking page.
    pub page_size: usize,
    /// Language code sent with tracking queries.
    pub tracking_language: String,
    /// Default callback sent with tracking queries.
    pub tracking_callback: Option<String>,
    /// Task pool limits for retries and callbacks.
    pub pool: PoolConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            page_size: crate::DEFAULT_PAGE_SIZE,
            tracking_language: LANGUAGE_PORTUGUESE.to_string(),
            tracking_callback: None,
            pool: PoolConfig::default(),
        }
    }
}

impl ReconcileConfig {
    /// Checks the settings before an engine is built.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` naming the first bad setting.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries < 0 {
            return Err(ReconcileError::configuration("max_retries must not be negative"));
        }
        if self.max_retries > crate::MAX_RETRY_CEILING {
            return Err(ReconcileError::configuration(format!(
                "max_retries must not exceed {}",
                crate::MAX_RETRY_CEILING
            )));
        }
        if self.page_size == 0 {
            return Err(ReconcileError::configuration("page_size must be greater than 0"));
        }
        if self.tracking_language.trim().is_empty() {
            return Err(ReconcileError::configuration("tracking_language must not be empty"));
        }
        Ok(())
    }
}

/// Tracking reconciliation, retry escalation, and follow-up over one pool.
pub struct ReconcileEngine {
    config: ReconcileConfig,
    provider: Arc<dyn ProviderHandler>,
    dispatcher: Dispatcher,
    poller: StatusPoller,
    reprocessor: ErrorReprocessor,
}

impl ReconcileEngine {
    /// Builds an engine and its task pool.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` for invalid settings.
    pub fn new(
        config: ReconcileConfig,
        storage: Arc<dyn RequestStorage>,
        provider: Arc<dyn ProviderHandler>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(TaskPool::new(config.pool.clone())?);
        let dispatcher = Dispatcher::new(notifier, pool);

        let poller = StatusPoller::new(
            storage.clone(),
            provider.clone(),
            dispatcher.clone(),
            config.tracking_language.clone(),
            config.tracking_callback.clone(),
        );
        let reprocessor = ErrorReprocessor::new(storage, provider.clone(), dispatcher.clone());

        Ok(Self { config, provider, dispatcher, poller, reprocessor })
    }

    /// Engine settings.
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Pool running retries and callbacks.
    pub fn pool(&self) -> &Arc<TaskPool> {
        self.dispatcher.pool()
    }

    /// Polls `Used` requests starting at `offset`.
    ///
    /// # Errors
    ///
    /// See [`StatusPoller::poll_used_requests`].
    pub async fn poll_used_requests(&self, offset: usize, page_size: usize) -> Result<PollSummary> {
        self.poller.poll_used_requests(offset, page_size).await
    }

    /// Polls every `Used` request with the configured page size.
    ///
    /// # Errors
    ///
    /// See [`StatusPoller::poll_used_requests`].
    pub async fn poll_all(&self) -> Result<PollSummary> {
        self.poller.poll_used_requests(0, self.config.page_size).await
    }

    /// Retries or escalates errored requests against `max_retries`.
    ///
    /// # Errors
    ///
    /// See [`ErrorReprocessor::reprocess_errored`].
    pub async fn reprocess_errored(&self, max_retries: i32) -> Result<RetrySummary> {
        self.reprocessor.reprocess_errored(max_retries).await
    }

    /// Retries or escalates errored requests against the configured ceiling.
    ///
    /// # Errors
    ///
    /// See [`ErrorReprocessor::reprocess_errored`].
    pub async fn reprocess_with_configured_ceiling(&self) -> Result<RetrySummary> {
        self.reprocessor.reprocess_errored(self.config.max_retries).await
    }

    /// Applies reverse updates of one kind and notifies each changed request.
    ///
    /// Returns how many notifications were scheduled. Errors for single
    /// updates are logged and skipped.
    pub async fn follow_updates(&self, kind: ReverseKind) -> usize {
        let results = self.provider.follow_reverse_logistic(kind).await;
        let total = results.len();
        let mut dispatched = 0;

        for result in results {
            match result {
                Ok(payload) => {
                    if self.dispatcher.dispatch(payload).await {
                        dispatched += 1;
                    }
                },
                Err(e) => {
                    warn!(
                        %kind,
                        category = %ErrorCategory::from(&e),
                        error = %e,
                        "reverse update failed"
                    );
                },
            }
        }

        info!(%kind, updates = total, dispatched, "reverse updates followed");
        dispatched
    }

    /// Closes the pool and waits for in-flight retries and callbacks.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::ShutdownTimeout` if tasks had to be aborted.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.pool().shutdown_graceful(timeout).await
    }
}
