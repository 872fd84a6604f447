//! Storage abstraction layer for the reconciliation engine.
//!
//! Provides a trait over the request operations the engine needs so the
//! polling and retry logic can be tested without a database. Production uses
//! the PostgreSQL repository from `postback_core::storage`; tests use the
//! in-memory `mock::MockRequestStorage`.

use std::{future::Future, pin::Pin, sync::Arc};

use postback_core::{
    error::Result,
    filter::Search,
    models::{Request, RequestStatus},
};

/// Storage operations required by the reconciliation engine.
pub trait RequestStorage: Send + Sync + 'static {
    /// Finds requests matching a search, honoring its pagination window.
    ///
    /// Results are ordered by creation time so successive windows do not
    /// overlap.
    fn search(
        &self,
        search: &Search,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Request>>> + Send + '_>>;

    /// Writes a new status for a request.
    ///
    /// The write is a single-row update keyed by the request ID. Besides
    /// `status` and `reason` it persists the request's current `retries`,
    /// `postage_code` and `tracking_code`, so callers adjust those fields on
    /// the request before calling.
    fn update_status(
        &self,
        request: &Request,
        status: RequestStatus,
        reason: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Finds a request by the provider's postage code.
    fn find_by_postage_code(
        &self,
        postage_code: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Request>>> + Send + '_>>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresRequestStorage {
    storage: Arc<postback_core::storage::Storage>,
}

impl PostgresRequestStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<postback_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl RequestStorage for PostgresRequestStorage {
    fn search(
        &self,
        search: &Search,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Request>>> + Send + '_>> {
        let storage = self.storage.clone();
        let search = search.clone();
        Box::pin(async move { storage.requests.search(&search).await })
    }

    fn update_status(
        &self,
        request: &Request,
        status: RequestStatus,
        reason: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let request = request.clone();
        Box::pin(async move {
            storage.requests.update_status(&request, status, reason.as_deref()).await
        })
    }

    fn find_by_postage_code(
        &self,
        postage_code: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Request>>> + Send + '_>> {
        let storage = self.storage.clone();
        let postage_code = postage_code.to_string();
        Box::pin(async move { storage.requests.find_by_postage_code(&postage_code).await })
    }
}

/// In-memory storage for tests.
pub mod mock {
    use std::collections::{HashMap, HashSet};

    use chrono::Utc;
    use postback_core::{error::CoreError, models::RequestId};
    use tokio::sync::RwLock;

    use super::*;

    /// Status write recorded by the mock.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedUpdate {
        /// Request that was written.
        pub request_id: RequestId,
        /// Status written.
        pub status: RequestStatus,
        /// Reason written.
        pub reason: Option<String>,
        /// Retry count written.
        pub retries: i32,
    }

    /// In-memory `RequestStorage` with call recording and error injection.
    #[derive(Clone)]
    pub struct MockRequestStorage {
        requests: Arc<RwLock<HashMap<RequestId, Request>>>,
        searches: Arc<RwLock<Vec<Search>>>,
        updates: Arc<RwLock<Vec<RecordedUpdate>>>,
        search_error: Arc<RwLock<Option<String>>>,
        failing_updates: Arc<RwLock<HashSet<RequestId>>>,
    }

    impl MockRequestStorage {
        /// Creates empty mock storage.
        pub fn new() -> Self {
            Self {
                requests: Arc::new(RwLock::new(HashMap::new())),
                searches: Arc::new(RwLock::new(Vec::new())),
                updates: Arc::new(RwLock::new(Vec::new())),
                search_error: Arc::new(RwLock::new(None)),
                failing_updates: Arc::new(RwLock::new(HashSet::new())),
            }
        }

        /// Stores a request.
        pub async fn add_request(&self, request: Request) {
            self.requests.write().await.insert(request.request_id, request);
        }

        /// Returns the stored copy of a request.
        pub async fn request(&self, request_id: RequestId) -> Option<Request> {
            self.requests.read().await.get(&request_id).cloned()
        }

        /// Returns every search issued so far.
        pub async fn searches(&self) -> Vec<Search> {
            self.searches.read().await.clone()
        }

        /// Returns every status write issued so far.
        pub async fn updates(&self) -> Vec<RecordedUpdate> {
            self.updates.read().await.clone()
        }

        /// Injects an error for the next search.
        pub async fn inject_search_error(&self, error: String) {
            *self.search_error.write().await = Some(error);
        }

        /// Makes every status write for `request_id` fail.
        pub async fn fail_updates_for(&self, request_id: RequestId) {
            self.failing_updates.write().await.insert(request_id);
        }
    }

    impl Default for MockRequestStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RequestStorage for MockRequestStorage {
        fn search(
            &self,
            search: &Search,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Request>>> + Send + '_>> {
            let search = search.clone();
            Box::pin(async move {
                self.searches.write().await.push(search.clone());

                if let Some(error) = self.search_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut matching: Vec<Request> = self
                    .requests
                    .read()
                    .await
                    .values()
                    .filter(|request| search.matches(request))
                    .cloned()
                    .collect();
                matching.sort_by(|a, b| {
                    a.created_at.cmp(&b.created_at).then(a.request_id.cmp(&b.request_id))
                });

                Ok(match search.window {
                    Some(page) => matching.into_iter().skip(page.offset).take(page.limit).collect(),
                    None => matching,
                })
            })
        }

        fn update_status(
            &self,
            request: &Request,
            status: RequestStatus,
            reason: Option<String>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let request = request.clone();
            Box::pin(async move {
                if self.failing_updates.read().await.contains(&request.request_id) {
                    return Err(CoreError::Database(format!(
                        "simulated update failure for {}",
                        request.request_id
                    )));
                }

                let mut requests = self.requests.write().await;
                let stored = requests.get_mut(&request.request_id).ok_or_else(|| {
                    CoreError::NotFound(format!("request {} not found", request.request_id))
                })?;

                stored.status = status;
                stored.reason.clone_from(&reason);
                stored.retries = request.retries;
                stored.postage_code.clone_from(&request.postage_code);
                stored.tracking_code.clone_from(&request.tracking_code);
                stored.updated_at = Utc::now();
                drop(requests);

                self.updates.write().await.push(RecordedUpdate {
                    request_id: request.request_id,
                    status,
                    reason,
                    retries: request.retries,
                });
                Ok(())
            })
        }

        fn find_by_postage_code(
            &self,
            postage_code: &str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Request>>> + Send + '_>> {
            let postage_code = postage_code.to_string();
            Box::pin(async move {
                Ok(self
                    .requests
                    .read()
                    .await
                    .values()
                    .find(|request| request.postage_code == postage_code)
                    .cloned())
            })
        }
    }
}
