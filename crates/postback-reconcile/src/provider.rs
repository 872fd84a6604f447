//! Tracking provider facade.
//!
//! The engine talks to the postal provider only through `ProviderHandler`:
//! a batched tracking query, a follow-up of reverse-logistics updates, and a
//! single reverse-logistics operation. Implementations own the wire protocol
//! and the bookkeeping a reverse operation leaves on the request.

use std::{future::Future, pin::Pin};

use postback_core::models::{NotificationPayload, Request, ReverseKind};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Language code for Portuguese event descriptions.
pub const LANGUAGE_PORTUGUESE: &str = "101";

/// Language code for English event descriptions.
pub const LANGUAGE_ENGLISH: &str = "102";

/// How many events the provider returns per object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryMode {
    /// Only the most recent event.
    #[serde(rename = "U")]
    MostRecent,
    /// Full event history, most recent first.
    #[serde(rename = "T")]
    All,
}

/// Batched tracking query sent once per polling page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingQuery {
    /// Language for event descriptions.
    pub language: String,
    /// Event history depth.
    pub mode: QueryMode,
    /// Tracking codes queried in this batch.
    pub objects: Vec<String>,
    /// Default callback the provider may push updates to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

impl TrackingQuery {
    /// Creates a most-recent-event query for the given codes.
    pub fn most_recent(
        language: impl Into<String>,
        objects: Vec<String>,
        callback: Option<String>,
    ) -> Self {
        Self { language: language.into(), mode: QueryMode::MostRecent, objects, callback }
    }
}

/// Single tracking event reported for an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    /// Delivery-type classifier (e.g. `BDE`).
    pub event_type: String,
    /// Status code within the event type (e.g. `01`).
    pub status: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Tracking result for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingObject {
    /// Object identifier, equal to the request's tracking code.
    pub object_id: String,
    /// Events, most recent first.
    #[serde(default)]
    pub events: Vec<TrackingEvent>,
}

impl TrackingObject {
    /// Most recent event, if any was reported.
    pub fn latest(&self) -> Option<&TrackingEvent> {
        self.events.first()
    }
}

/// Provider operations consumed by the engine.
pub trait ProviderHandler: Send + Sync + 'static {
    /// Queries tracking for every object in the batch in one round trip.
    fn track_objects(
        &self,
        query: &TrackingQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<TrackingObject>>> + Send + '_>>;

    /// Fetches reverse-logistics updates of one kind and applies them.
    ///
    /// Returns one payload per request whose state changed, or an error per
    /// update that could not be applied.
    fn follow_reverse_logistic(
        &self,
        kind: ReverseKind,
    ) -> Pin<Box<dyn Future<Output = Vec<Result<NotificationPayload>>> + Send + '_>>;

    /// Performs the reverse-logistics operation for one request.
    ///
    /// Implementations record the outcome on the request through storage:
    /// success moves it to `Used` with `retries = 0`, failure keeps it in
    /// `Error` with `retries` incremented.
    fn do_reverse_logistic(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Scriptable provider for tests.
pub mod mock {
    use std::{
        collections::{HashMap, HashSet},
        time::Duration,
    };

    use postback_core::models::RequestId;
    use tokio::sync::RwLock;

    use super::*;
    use crate::error::ReconcileError;

    /// Provider double that records calls and returns scripted results.
    #[derive(Default)]
    pub struct MockProvider {
        tracking: RwLock<HashMap<String, TrackingObject>>,
        stale_objects: RwLock<Vec<TrackingObject>>,
        track_error: RwLock<Option<ReconcileError>>,
        queries: RwLock<Vec<TrackingQuery>>,
        reverse_calls: RwLock<Vec<RequestId>>,
        reverse_failures: RwLock<HashSet<RequestId>>,
        reverse_delay: RwLock<Option<Duration>>,
        follow_results: RwLock<HashMap<ReverseKind, Vec<Result<NotificationPayload>>>>,
        follow_calls: RwLock<Vec<ReverseKind>>,
    }

    impl MockProvider {
        /// Creates a provider with no scripted tracking.
        pub fn new() -> Self {
            Self::default()
        }

        /// Scripts the latest event reported for a tracking code.
        pub async fn set_latest_event(&self, tracking_code: &str, event_type: &str, status: &str) {
            let object = TrackingObject {
                object_id: tracking_code.to_string(),
                events: vec![TrackingEvent {
                    event_type: event_type.to_string(),
                    status: status.to_string(),
                    description: None,
                }],
            };
            self.tracking.write().await.insert(tracking_code.to_string(), object);
        }

        /// Adds an object to every response regardless of the query.
        pub async fn add_stale_object(&self, object: TrackingObject) {
            self.stale_objects.write().await.push(object);
        }

        /// Fails the next tracking query.
        pub async fn fail_next_track(&self, error: ReconcileError) {
            *self.track_error.write().await = Some(error);
        }

        /// Makes reverse operations for `request_id` fail.
        pub async fn fail_reverse_for(&self, request_id: RequestId) {
            self.reverse_failures.write().await.insert(request_id);
        }

        /// Delays every reverse operation.
        pub async fn set_reverse_delay(&self, delay: Duration) {
            *self.reverse_delay.write().await = Some(delay);
        }

        /// Scripts the follow-up results for a kind.
        pub async fn set_follow_results(
            &self,
            kind: ReverseKind,
            results: Vec<Result<NotificationPayload>>,
        ) {
            self.follow_results.write().await.insert(kind, results);
        }

        /// Tracking queries received so far.
        pub async fn queries(&self) -> Vec<TrackingQuery> {
            self.queries.read().await.clone()
        }

        /// Requests passed to `do_reverse_logistic` so far.
        pub async fn reverse_calls(&self) -> Vec<RequestId> {
            self.reverse_calls.read().await.clone()
        }

        /// Kinds passed to `follow_reverse_logistic` so far.
        pub async fn follow_calls(&self) -> Vec<ReverseKind> {
            self.follow_calls.read().await.clone()
        }
    }

    impl ProviderHandler for MockProvider {
        fn track_objects(
            &self,
            query: &TrackingQuery,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<TrackingObject>>> + Send + '_>> {
            let query = query.clone();
            Box::pin(async move {
                self.queries.write().await.push(query.clone());

                if let Some(error) = self.track_error.write().await.take() {
                    return Err(error);
                }

                let tracking = self.tracking.read().await;
                let mut objects: Vec<TrackingObject> =
                    query.objects.iter().filter_map(|code| tracking.get(code).cloned()).collect();
                drop(tracking);

                objects.extend(self.stale_objects.read().await.iter().cloned());
                Ok(objects)
            })
        }

        fn follow_reverse_logistic(
            &self,
            kind: ReverseKind,
        ) -> Pin<Box<dyn Future<Output = Vec<Result<NotificationPayload>>> + Send + '_>> {
            Box::pin(async move {
                self.follow_calls.write().await.push(kind);
                self.follow_results.read().await.get(&kind).cloned().unwrap_or_default()
            })
        }

        fn do_reverse_logistic(
            &self,
            request: Request,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.reverse_calls.write().await.push(request.request_id);

                let delay = *self.reverse_delay.read().await;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }

                if self.reverse_failures.read().await.contains(&request.request_id) {
                    return Err(ReconcileError::provider(format!(
                        "reverse operation rejected for {}",
                        request.request_id
                    )));
                }
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_recent_query_serializes_provider_codes() {
        let query = TrackingQuery::most_recent(
            LANGUAGE_PORTUGUESE,
            vec!["SS123456789BR".to_string()],
            None,
        );
        let json = serde_json::to_value(&query).unwrap();

        assert_eq!(json["language"], "101");
        assert_eq!(json["mode"], "U");
        assert_eq!(json["objects"][0], "SS123456789BR");
        assert!(json.get("callback").is_none());
    }

    #[test]
    fn latest_event_is_first_in_list() {
        let object: TrackingObject = serde_json::from_value(serde_json::json!({
            "objectId": "SS123456789BR",
            "events": [
                {"eventType": "BDE", "status": "01", "description": "Objeto entregue"},
                {"eventType": "OEC", "status": "01"}
            ]
        }))
        .unwrap();

        let latest = object.latest().unwrap();
        assert_eq!(latest.event_type, "BDE");
        assert_eq!(latest.status, "01");
    }

    #[test]
    fn object_without_events_has_no_latest() {
        let object: TrackingObject =
            serde_json::from_value(serde_json::json!({"objectId": "X"})).unwrap();
        assert!(object.latest().is_none());
    }
}
