//! Retry and escalation of errored requests.
//!
//! Requests below the retry ceiling get another reverse operation with the
//! provider. Requests at the ceiling are not retried; their requester is
//! told the request is stuck in `error` and the retry counter is pushed past
//! the ceiling so the escalation happens once.

use std::{sync::Arc, time::Duration};

use postback_core::{
    filter::{Field, Operator, Search},
    models::{NotificationPayload, Request, RequestStatus},
};
use tracing::{error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::{ReconcileError, Result},
    pool::TaskKind,
    provider::ProviderHandler,
    storage::RequestStorage,
};

/// Counters for one reprocessing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySummary {
    /// Errored requests at or below the ceiling.
    pub found: usize,
    /// Provider retries submitted.
    pub retried: usize,
    /// Requests escalated to their requester.
    pub escalated: usize,
}

/// Retries or escalates requests in `Error`.
pub struct ErrorReprocessor {
    storage: Arc<dyn RequestStorage>,
    provider: Arc<dyn ProviderHandler>,
    dispatcher: Dispatcher,
}

impl ErrorReprocessor {
    /// Creates a reprocessor.
    pub fn new(
        storage: Arc<dyn RequestStorage>,
        provider: Arc<dyn ProviderHandler>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self { storage, provider, dispatcher }
    }

    /// Handles every `Error` request with `retries <= max_retries`.
    ///
    /// Retries run on the task pool; this call returns once they are
    /// submitted, not once they finish.
    ///
    /// # Errors
    ///
    /// - `Configuration` when `max_retries` is negative or above
    ///   [`MAX_RETRY_CEILING`](crate::MAX_RETRY_CEILING)
    /// - `Storage` when the errored requests cannot be fetched
    pub async fn reprocess_errored(&self, max_retries: i32) -> Result<RetrySummary> {
        if max_retries < 0 {
            return Err(ReconcileError::configuration("max retries must not be negative"));
        }
        if max_retries > crate::MAX_RETRY_CEILING {
            return Err(ReconcileError::configuration(format!(
                "max retries must not exceed {}",
                crate::MAX_RETRY_CEILING
            )));
        }

        let search = Search::new()
            .and(Field::Retries, Operator::Le, max_retries)
            .and(Field::Status, Operator::Eq, RequestStatus::Error);

        let requests = self.storage.search(&search).await.map_err(|e| {
            error!(max_retries, error = %e, "failed to fetch errored requests");
            ReconcileError::from(e)
        })?;

        let mut summary = RetrySummary { found: requests.len(), ..RetrySummary::default() };

        for request in requests {
            if request.retries >= max_retries {
                self.escalate(request, max_retries).await;
                summary.escalated += 1;
            } else if self.retry(request).await {
                summary.retried += 1;
            }
        }

        info!(
            found = summary.found,
            retried = summary.retried,
            escalated = summary.escalated,
            max_retries,
            "errored requests reprocessed"
        );

        Ok(summary)
    }

    /// Notifies the requester and moves the counter past the ceiling.
    async fn escalate(&self, mut request: Request, max_retries: i32) {
        let request_id = request.request_id;
        request.retries = max_retries + 1;

        warn!(
            %request_id,
            retries = request.retries,
            reason = request.reason.as_deref().unwrap_or_default(),
            "retry ceiling reached, escalating to requester"
        );

        let reason = request.reason.clone();
        if let Err(e) = self.storage.update_status(&request, RequestStatus::Error, reason).await {
            error!(%request_id, error = %e, "failed to record escalation");
        }

        self.dispatcher.dispatch(NotificationPayload::from(&request)).await;
    }

    /// Submits one provider retry. Returns whether it was accepted.
    ///
    /// A retry cut off by the task deadline is recorded as a failed attempt,
    /// so it still counts toward the ceiling.
    async fn retry(&self, request: Request) -> bool {
        let pool = self.dispatcher.pool();
        let provider = self.provider.clone();
        let storage = self.storage.clone();
        let request_id = request.request_id;
        let label = format!("reverse {request_id} attempt {}", request.retries + 1);
        let deadline = pool.task_timeout();
        let snapshot = request.clone();

        match pool
            .submit_with_timeout_fallback(
                TaskKind::ProviderRetry,
                label,
                async move { provider.do_reverse_logistic(request).await },
                async move { record_timed_out_retry(storage.as_ref(), snapshot, deadline).await },
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(%request_id, error = %e, "provider retry not submitted");
                false
            },
        }
    }
}

/// Stores a timed-out retry as a failed attempt: `Error`, `retries + 1`.
async fn record_timed_out_retry(
    storage: &dyn RequestStorage,
    mut request: Request,
    deadline: Duration,
) -> Result<()> {
    let reason = format!("provider retry timed out after {deadline:?}");
    request.transition_to(RequestStatus::Error, Some(reason.clone()))?;
    request.retries = request.retries.saturating_add(1);

    storage.update_status(&request, RequestStatus::Error, Some(reason)).await?;
    warn!(
        request_id = %request.request_id,
        retries = request.retries,
        "provider retry timed out, counted as failed attempt"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        client::mock::RecordingNotifier,
        pool::{PoolConfig, TaskPool},
        provider::mock::MockProvider,
        storage::mock::MockRequestStorage,
    };

    fn errored(retries: i32) -> Request {
        let mut request = Request::new("PC", "TC", "https://example.com/cb");
        request.status = RequestStatus::Error;
        request.retries = retries;
        request.reason = Some("provider unavailable".to_string());
        request
    }

    fn reprocessor(
        storage: &MockRequestStorage,
        provider: &Arc<MockProvider>,
        notifier: &Arc<RecordingNotifier>,
    ) -> ErrorReprocessor {
        let pool = TaskPool::new(PoolConfig {
            concurrency: 2,
            task_timeout: Duration::from_secs(5),
        })
        .unwrap();
        let dispatcher = Dispatcher::new(notifier.clone(), Arc::new(pool));
        ErrorReprocessor::new(Arc::new(storage.clone()), provider.clone(), dispatcher)
    }

    #[tokio::test]
    async fn negative_ceiling_is_rejected() {
        let storage = MockRequestStorage::new();
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let reprocessor = reprocessor(&storage, &provider, &notifier);

        let error = reprocessor.reprocess_errored(-1).await.unwrap_err();
        assert!(matches!(error, ReconcileError::Configuration { .. }));
    }

    #[tokio::test]
    async fn ceiling_above_bound_is_rejected() {
        let storage = MockRequestStorage::new();
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let reprocessor = reprocessor(&storage, &provider, &notifier);

        let error = reprocessor.reprocess_errored(i32::MAX).await.unwrap_err();
        assert!(matches!(error, ReconcileError::Configuration { .. }));
        assert!(storage.searches().await.is_empty());
    }

    #[tokio::test]
    async fn escalation_pushes_retries_past_ceiling() {
        let storage = MockRequestStorage::new();
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let request = errored(3);
        storage.add_request(request.clone()).await;
        let reprocessor = reprocessor(&storage, &provider, &notifier);

        let first = reprocessor.reprocess_errored(3).await.unwrap();
        let second = reprocessor.reprocess_errored(3).await.unwrap();
        reprocessor.dispatcher.pool().drain().await;

        assert_eq!(first.escalated, 1);
        assert_eq!(second.found, 0);
        let stored = storage.request(request.request_id).await.unwrap();
        assert_eq!(stored.retries, 4);
        assert_eq!(stored.status, RequestStatus::Error);
        assert_eq!(stored.reason.as_deref(), Some("provider unavailable"));
        assert_eq!(notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn requests_above_ceiling_are_not_selected() {
        let storage = MockRequestStorage::new();
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        storage.add_request(errored(7)).await;
        let reprocessor = reprocessor(&storage, &provider, &notifier);

        let summary = reprocessor.reprocess_errored(3).await.unwrap();

        assert_eq!(summary, RetrySummary::default());
    }

    #[tokio::test]
    async fn storage_failure_aborts_run() {
        let storage = MockRequestStorage::new();
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        storage.add_request(errored(0)).await;
        storage.inject_search_error("connection reset".to_string()).await;
        let reprocessor = reprocessor(&storage, &provider, &notifier);

        let error = reprocessor.reprocess_errored(3).await.unwrap_err();

        assert!(matches!(error, ReconcileError::Storage { .. }));
        assert!(provider.reverse_calls().await.is_empty());
    }
}
