//! Retry and escalation behavior of the errored-request pass.

use std::{sync::Arc, time::Duration};

use postback_core::models::{Request, RequestStatus};
use postback_reconcile::{
    client::mock::RecordingNotifier,
    gateway::{GatewayConfig, GatewayEndpoint, GatewayProvider},
    pool::PoolConfig,
    provider::mock::MockProvider,
    storage::mock::MockRequestStorage,
    ReconcileConfig, ReconcileEngine,
};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn errored(retries: i32) -> Request {
    let mut request = Request::new("PC1", "SS1BR", "https://example.com/cb");
    request.status = RequestStatus::Error;
    request.retries = retries;
    request.reason = Some("provider unavailable".to_string());
    request
}

fn engine(
    storage: &MockRequestStorage,
    provider: &Arc<MockProvider>,
    notifier: &Arc<RecordingNotifier>,
) -> ReconcileEngine {
    let config = ReconcileConfig {
        max_retries: 3,
        pool: PoolConfig { concurrency: 4, task_timeout: Duration::from_secs(5) },
        ..ReconcileConfig::default()
    };
    ReconcileEngine::new(config, Arc::new(storage.clone()), provider.clone(), notifier.clone())
        .unwrap()
}

#[tokio::test]
async fn request_at_ceiling_is_escalated_without_provider_call() {
    let storage = MockRequestStorage::new();
    let provider = Arc::new(MockProvider::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let request = errored(3);
    storage.add_request(request.clone()).await;
    let engine = engine(&storage, &provider, &notifier);

    let summary = engine.reprocess_errored(3).await.unwrap();
    engine.pool().drain().await;

    assert_eq!(summary.found, 1);
    assert_eq!(summary.escalated, 1);
    assert_eq!(summary.retried, 0);
    assert!(provider.reverse_calls().await.is_empty());

    let sent = notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].request_id, request.request_id);
    assert_eq!(sent[0].status, RequestStatus::Error);
}

#[tokio::test]
async fn request_below_ceiling_gets_exactly_one_retry() {
    let storage = MockRequestStorage::new();
    let provider = Arc::new(MockProvider::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let request = errored(1);
    storage.add_request(request.clone()).await;
    let engine = engine(&storage, &provider, &notifier);

    let summary = engine.reprocess_errored(3).await.unwrap();
    engine.pool().drain().await;

    assert_eq!(summary.retried, 1);
    assert_eq!(provider.reverse_calls().await, vec![request.request_id]);
    assert!(notifier.sent().await.is_empty());
}

#[tokio::test]
async fn mixed_batch_splits_between_retry_and_escalation() {
    let storage = MockRequestStorage::new();
    let provider = Arc::new(MockProvider::new());
    let notifier = Arc::new(RecordingNotifier::new());
    for retries in [0, 1, 2, 3, 3, 4] {
        storage.add_request(errored(retries)).await;
    }
    let mut used = errored(0);
    used.status = RequestStatus::Used;
    storage.add_request(used).await;
    let engine = engine(&storage, &provider, &notifier);

    let summary = engine.reprocess_with_configured_ceiling().await.unwrap();
    engine.pool().drain().await;

    assert_eq!(summary.found, 5);
    assert_eq!(summary.retried, 3);
    assert_eq!(summary.escalated, 2);
    assert_eq!(provider.reverse_calls().await.len(), 3);
    assert_eq!(notifier.sent().await.len(), 2);
}

#[tokio::test]
async fn failed_retry_does_not_block_the_others() {
    let storage = MockRequestStorage::new();
    let provider = Arc::new(MockProvider::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let failing = errored(0);
    let fine = errored(1);
    storage.add_request(failing.clone()).await;
    storage.add_request(fine.clone()).await;
    provider.fail_reverse_for(failing.request_id).await;
    let engine = engine(&storage, &provider, &notifier);

    engine.reprocess_errored(3).await.unwrap();
    engine.pool().drain().await;

    let stats = engine.pool().stats().await;
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(provider.reverse_calls().await.len(), 2);
}

#[tokio::test]
async fn slow_retries_return_before_completion() {
    let storage = MockRequestStorage::new();
    let provider = Arc::new(MockProvider::new());
    let notifier = Arc::new(RecordingNotifier::new());
    provider.set_reverse_delay(Duration::from_millis(200)).await;
    for _ in 0..3 {
        storage.add_request(errored(0)).await;
    }
    let engine = engine(&storage, &provider, &notifier);

    let started = tokio::time::Instant::now();
    let summary = engine.reprocess_errored(3).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(summary.retried, 3);

    engine.shutdown(Duration::from_secs(2)).await.unwrap();
    assert_eq!(engine.pool().stats().await.succeeded, 3);
}

#[tokio::test]
async fn escalated_request_is_notified_once_across_runs() {
    let storage = MockRequestStorage::new();
    let provider = Arc::new(MockProvider::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let request = errored(3);
    storage.add_request(request.clone()).await;
    let engine = engine(&storage, &provider, &notifier);

    for _ in 0..3 {
        engine.reprocess_errored(3).await.unwrap();
    }
    engine.pool().drain().await;

    assert_eq!(notifier.sent().await.len(), 1);
    assert_eq!(storage.request(request.request_id).await.unwrap().retries, 4);
}

#[tokio::test]
async fn retry_cut_off_by_task_deadline_still_counts_toward_ceiling() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/reverse/requests"))
        .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let storage = MockRequestStorage::new();
    let notifier = Arc::new(RecordingNotifier::new());
    let request = errored(1);
    storage.add_request(request.clone()).await;

    let endpoint = GatewayEndpoint {
        url: format!("{}/reverse", server.uri()),
        username: "reverse".to_string(),
        password: "secret".to_string(),
    };
    let gateway = GatewayProvider::new(
        GatewayConfig {
            tracking: endpoint.clone(),
            reverse: endpoint,
            timeout: Duration::from_secs(30),
        },
        Arc::new(storage.clone()),
    )
    .unwrap();
    let config = ReconcileConfig {
        max_retries: 3,
        pool: PoolConfig { concurrency: 2, task_timeout: Duration::from_millis(100) },
        ..ReconcileConfig::default()
    };
    let engine =
        ReconcileEngine::new(config, Arc::new(storage.clone()), Arc::new(gateway), notifier.clone())
            .unwrap();

    let mut retries_seen = Vec::new();
    for _ in 0..4 {
        engine.reprocess_errored(3).await.unwrap();
        engine.pool().drain().await;
        retries_seen.push(storage.request(request.request_id).await.unwrap().retries);
    }

    // 1 -> 2 -> 3 by timed-out attempts, then escalation past the ceiling.
    assert_eq!(retries_seen, vec![2, 3, 4, 4]);
    assert_eq!(engine.pool().stats().await.timed_out, 2);

    let stored = storage.request(request.request_id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Error);
    assert!(stored.reason.unwrap().contains("timed out"));
    assert_eq!(notifier.sent().await.len(), 1);
}

#[tokio::test]
async fn slow_mock_retry_is_recorded_as_failed_attempt() {
    let storage = MockRequestStorage::new();
    let provider = Arc::new(MockProvider::new());
    let notifier = Arc::new(RecordingNotifier::new());
    provider.set_reverse_delay(Duration::from_secs(5)).await;
    let request = errored(0);
    storage.add_request(request.clone()).await;

    let config = ReconcileConfig {
        pool: PoolConfig { concurrency: 1, task_timeout: Duration::from_millis(50) },
        ..ReconcileConfig::default()
    };
    let engine =
        ReconcileEngine::new(config, Arc::new(storage.clone()), provider.clone(), notifier)
            .unwrap();

    engine.reprocess_errored(3).await.unwrap();
    engine.pool().drain().await;

    let updates = storage.updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status, RequestStatus::Error);
    assert_eq!(updates[0].retries, 1);
}
