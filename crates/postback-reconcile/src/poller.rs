//! Tracking poll for requests awaiting delivery confirmation.
//!
//! Every `Used` request is checked against the provider in pages. Each page
//! costs one storage query and one batched tracking call; requests whose
//! latest event is conclusive move to a terminal status and their requester
//! is notified.

use std::{collections::HashMap, sync::Arc};

use postback_core::{
    filter::{Field, Operator, Search},
    models::{NotificationPayload, Request, RequestStatus},
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    classify::{classify, Classification},
    dispatcher::Dispatcher,
    error::{ReconcileError, Result},
    provider::{ProviderHandler, TrackingQuery},
    storage::RequestStorage,
};

/// Counters for one polling run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Pages fetched from storage, including the final short one.
    pub pages: usize,
    /// Tracking codes sent to the provider.
    pub queried: usize,
    /// Requests moved to `Delivered`.
    pub delivered: usize,
    /// Requests moved to `FailedDelivery`.
    pub failed: usize,
    /// Requests left in `Used`.
    pub unchanged: usize,
    /// Provider objects that matched no request on their page.
    pub unmatched: usize,
    /// Transitions that could not be written.
    pub update_errors: usize,
}

/// Polls the provider for `Used` requests and applies conclusive outcomes.
pub struct StatusPoller {
    storage: Arc<dyn RequestStorage>,
    provider: Arc<dyn ProviderHandler>,
    dispatcher: Dispatcher,
    language: String,
    callback: Option<String>,
}

impl StatusPoller {
    /// Creates a poller.
    ///
    /// `language` and `callback` are sent with every tracking query.
    pub fn new(
        storage: Arc<dyn RequestStorage>,
        provider: Arc<dyn ProviderHandler>,
        dispatcher: Dispatcher,
        language: impl Into<String>,
        callback: Option<String>,
    ) -> Self {
        Self { storage, provider, dispatcher, language: language.into(), callback }
    }

    /// Polls every `Used` request starting at `offset`.
    ///
    /// Pages are fetched while they come back full. Requests that leave
    /// `Used` during a page no longer occupy an offset, so the next page
    /// starts after the rows that are still `Used`.
    ///
    /// # Errors
    ///
    /// - `Configuration` when `page_size` is zero
    /// - `Storage` when a page cannot be fetched
    /// - the provider's error when a tracking call fails
    ///
    /// Transitions written before the failure are kept.
    pub async fn poll_used_requests(&self, offset: usize, page_size: usize) -> Result<PollSummary> {
        if page_size == 0 {
            return Err(ReconcileError::configuration("page size must be greater than 0"));
        }

        let mut summary = PollSummary::default();
        let mut offset = offset;

        loop {
            let search = Search::new()
                .and(Field::Status, Operator::Eq, RequestStatus::Used)
                .paginate(offset, page_size);

            let page = self.storage.search(&search).await.map_err(|e| {
                error!(offset, page_size, error = %e, "failed to fetch used requests");
                ReconcileError::from(e)
            })?;

            if page.is_empty() {
                break;
            }

            summary.pages += 1;
            let is_full = page.len() == page_size;

            let span = info_span!("poll_page", offset, page_size, requests = page.len());
            let still_used = self.reconcile_page(page, &mut summary).instrument(span).await?;

            if !is_full {
                break;
            }
            offset += still_used;
        }

        info!(
            pages = summary.pages,
            queried = summary.queried,
            delivered = summary.delivered,
            failed = summary.failed,
            unchanged = summary.unchanged,
            unmatched = summary.unmatched,
            update_errors = summary.update_errors,
            "tracking poll finished"
        );

        Ok(summary)
    }

    /// Reconciles one page and returns how many of its requests are still
    /// `Used` in storage.
    async fn reconcile_page(&self, page: Vec<Request>, summary: &mut PollSummary) -> Result<usize> {
        let page_len = page.len();
        let mut by_code: HashMap<String, Vec<Request>> = HashMap::new();

        for request in page {
            let code = request.tracking_code.trim();
            if code.is_empty() {
                warn!(request_id = %request.request_id, "used request has no tracking code, skipping");
                continue;
            }
            by_code.entry(code.to_string()).or_default().push(request);
        }

        if by_code.is_empty() {
            summary.unchanged += page_len;
            return Ok(page_len);
        }

        let mut objects: Vec<String> = by_code.keys().cloned().collect();
        objects.sort();
        summary.queried += objects.len();

        let query = TrackingQuery::most_recent(&self.language, objects, self.callback.clone());
        let tracked = self.provider.track_objects(&query).await.map_err(|e| {
            error!(error = %e, "tracking query failed");
            e
        })?;

        let mut transitioned = 0;
        for object in tracked {
            let Some(requests) = by_code.remove(object.object_id.trim()) else {
                debug!(object_id = %object.object_id, "tracking object matches no request on page");
                summary.unmatched += 1;
                continue;
            };

            let (status, reason) = match classify(&object) {
                Classification::Delivered => (RequestStatus::Delivered, None),
                Classification::Failed { reason } => {
                    (RequestStatus::FailedDelivery, Some(reason.to_string()))
                },
                Classification::Pending => continue,
            };

            for request in requests {
                if self.apply(request, status, reason.clone()).await {
                    transitioned += 1;
                    match status {
                        RequestStatus::Delivered => summary.delivered += 1,
                        _ => summary.failed += 1,
                    }
                } else {
                    summary.update_errors += 1;
                }
            }
        }

        let still_used = page_len - transitioned;
        summary.unchanged += still_used;
        Ok(still_used)
    }

    /// Writes a terminal transition and notifies the requester.
    ///
    /// Returns whether the transition was stored.
    async fn apply(
        &self,
        mut request: Request,
        status: RequestStatus,
        reason: Option<String>,
    ) -> bool {
        let request_id = request.request_id;

        if let Err(e) = request.transition_to(status, reason.clone()) {
            warn!(%request_id, error = %e, "skipping transition");
            return false;
        }

        if let Err(e) = self.storage.update_status(&request, status, reason).await {
            error!(
                %request_id,
                tracking_code = %request.tracking_code,
                %status,
                error = %e,
                "failed to store transition"
            );
            return false;
        }

        info!(
            %request_id,
            tracking_code = %request.tracking_code,
            %status,
            "request reached final status"
        );
        self.dispatcher.dispatch(NotificationPayload::from(&request)).await;
        true
    }
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

    struct Fixture {
        storage: MockRequestStorage,
        provider: Arc<MockProvider>,
        notifier: Arc<RecordingNotifier>,
        poller: StatusPoller,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let storage = MockRequestStorage::new();
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let pool = TaskPool::new(PoolConfig {
            concurrency: 4,
            task_timeout: Duration::from_secs(5),
        })
        .unwrap();
        let dispatcher = Dispatcher::new(notifier.clone(), Arc::new(pool));
        let poller = StatusPoller::new(
            Arc::new(storage.clone()),
            provider.clone(),
            dispatcher.clone(),
            "101",
            None,
        );
        Fixture { storage, provider, notifier, poller, dispatcher }
    }

    fn used(tracking_code: &str) -> Request {
        let mut request = Request::new("PC", tracking_code, "https://example.com/cb");
        request.status = RequestStatus::Used;
        request
    }

    #[tokio::test]
    async fn zero_page_size_is_rejected() {
        let f = fixture();
        let error = f.poller.poll_used_requests(0, 0).await.unwrap_err();
        assert!(matches!(error, ReconcileError::Configuration { .. }));
        assert!(f.storage.searches().await.is_empty());
    }

    #[tokio::test]
    async fn empty_page_has_no_side_effects() {
        let f = fixture();
        let summary = f.poller.poll_used_requests(0, 10).await.unwrap();

        assert_eq!(summary, PollSummary::default());
        assert!(f.provider.queries().await.is_empty());
    }

    #[tokio::test]
    async fn requests_without_tracking_code_are_not_queried() {
        let f = fixture();
        f.storage.add_request(used("")).await;
        f.storage.add_request(used("SS2BR")).await;

        f.poller.poll_used_requests(0, 10).await.unwrap();

        let queries = f.provider.queries().await;
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].objects, vec!["SS2BR".to_string()]);
    }

    #[tokio::test]
    async fn failed_update_keeps_request_used_and_continues() {
        let f = fixture();
        let broken = used("SS1BR");
        let fine = used("SS2BR");
        f.storage.add_request(broken.clone()).await;
        f.storage.add_request(fine.clone()).await;
        f.storage.fail_updates_for(broken.request_id).await;
        f.provider.set_latest_event("SS1BR", "BDE", "01").await;
        f.provider.set_latest_event("SS2BR", "BDE", "01").await;

        let summary = f.poller.poll_used_requests(0, 10).await.unwrap();
        f.dispatcher.pool().drain().await;

        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.update_errors, 1);
        let broken = f.storage.request(broken.request_id).await.unwrap();
        let fine = f.storage.request(fine.request_id).await.unwrap();
        assert_eq!(broken.status, RequestStatus::Used);
        assert_eq!(fine.status, RequestStatus::Delivered);
        assert_eq!(f.notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn objects_for_other_requests_are_ignored() {
        let f = fixture();
        f.storage.add_request(used("SS1BR")).await;
        f.provider
            .add_stale_object(crate::provider::TrackingObject {
                object_id: "XX9BR".to_string(),
                events: Vec::new(),
            })
            .await;

        let summary = f.poller.poll_used_requests(0, 10).await.unwrap();

        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.unchanged, 1);
        assert!(f.storage.updates().await.is_empty());
    }
}
