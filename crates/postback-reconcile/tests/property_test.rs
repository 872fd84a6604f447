//! Property-based tests for tracking poll pagination.
//!
//! Whatever the page size and whichever requests become terminal along the
//! way, one poll must query every `Used` request exactly once and stop.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use postback_core::models::{Request, RequestStatus};
use postback_reconcile::{
    client::mock::RecordingNotifier, pool::PoolConfig, provider::mock::MockProvider,
    storage::mock::MockRequestStorage, ReconcileConfig, ReconcileEngine,
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Delivered,
    Failed,
    Pending,
}

fn outcome_strategy() -> impl Strategy<Value = Outcome> {
    prop_oneof![Just(Outcome::Delivered), Just(Outcome::Failed), Just(Outcome::Pending)]
}

fn run_poll(outcomes: &[Outcome], page_size: usize) -> (usize, HashMap<String, usize>, usize) {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    runtime.block_on(async {
        let storage = MockRequestStorage::new();
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = ReconcileConfig {
            pool: PoolConfig { concurrency: 8, task_timeout: Duration::from_secs(5) },
            ..ReconcileConfig::default()
        };
        let engine = ReconcileEngine::new(
            config,
            Arc::new(storage.clone()),
            provider.clone(),
            notifier.clone(),
        )
        .unwrap();

        let base = Utc::now() - TimeDelta::hours(1);
        for (i, outcome) in outcomes.iter().enumerate() {
            let code = format!("SS{i:09}BR");
            let mut request = Request::new(format!("PC{i}"), code.clone(), "https://example.com/cb");
            request.status = RequestStatus::Used;
            request.created_at = base + TimeDelta::seconds(i as i64);
            storage.add_request(request).await;

            match outcome {
                Outcome::Delivered => provider.set_latest_event(&code, "BDR", "01").await,
                Outcome::Failed => provider.set_latest_event(&code, "BDE", "07").await,
                Outcome::Pending => provider.set_latest_event(&code, "RO", "01").await,
            }
        }

        let summary = engine.poll_used_requests(0, page_size).await.unwrap();
        engine.pool().drain().await;

        let mut counts = HashMap::new();
        for query in provider.queries().await {
            for code in query.objects {
                *counts.entry(code).or_insert(0) += 1;
            }
        }

        (summary.pages, counts, notifier.sent().await.len())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_used_request_is_queried_exactly_once(
        outcomes in prop::collection::vec(outcome_strategy(), 0..40),
        page_size in 1usize..8,
    ) {
        let (_, counts, notified) = run_poll(&outcomes, page_size);

        prop_assert_eq!(counts.len(), outcomes.len());
        prop_assert!(counts.values().all(|count| *count == 1));

        let terminal = outcomes.iter().filter(|o| !matches!(o, Outcome::Pending)).count();
        prop_assert_eq!(notified, terminal);
    }

    #[test]
    fn page_count_matches_window_count_when_nothing_transitions(
        total in 0usize..40,
        page_size in 1usize..8,
    ) {
        let outcomes = vec![Outcome::Pending; total];
        let (pages, _, notified) = run_poll(&outcomes, page_size);

        prop_assert_eq!(pages, total.div_ceil(page_size));
        prop_assert_eq!(notified, 0);
    }
}
