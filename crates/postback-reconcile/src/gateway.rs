//! Provider adapter for a JSON tracking gateway.
//!
//! The gateway translates the postal provider's native protocol into three
//! JSON endpoints: a batched tracking query, a reverse-operation request, and
//! a feed of reverse-operation updates per kind. This adapter calls them with
//! basic authentication and records every reverse outcome on the request.

use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use postback_core::models::{NotificationPayload, Request, RequestId, RequestStatus, ReverseKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::{ReconcileError, Result},
    provider::{ProviderHandler, TrackingObject, TrackingQuery},
    storage::RequestStorage,
};

/// URL and basic auth credentials of one gateway service.
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayEndpoint {
    /// Service URL.
    pub url: String,
    /// Basic auth user.
    pub username: String,
    /// Basic auth password.
    pub password: String,
}

impl fmt::Debug for GatewayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayEndpoint")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Gateway services and call timeout.
///
/// Tracking and reverse logistics are separate services with their own
/// credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Tracking query endpoint.
    pub tracking: GatewayEndpoint,
    /// Base of the reverse-logistics endpoints.
    pub reverse: GatewayEndpoint,
    /// Timeout for a single gateway call.
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TrackingResponse {
    #[serde(default)]
    objects: Vec<TrackingObject>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReverseOrder<'a> {
    request_id: RequestId,
    postage_code: &'a str,
    tracking_code: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReverseReceipt {
    postage_code: String,
    #[serde(default)]
    tracking_code: Option<String>,
}

/// State change reported by the gateway for one reverse operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseUpdate {
    /// Postage code identifying the request.
    pub postage_code: String,
    /// Tracking code, once the parcel is posted.
    #[serde(default)]
    pub tracking_code: Option<String>,
    /// Status the request should move to.
    pub status: RequestStatus,
    /// Reason reported with the change.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `ProviderHandler` backed by the JSON gateway.
pub struct GatewayProvider {
    client: reqwest::Client,
    config: GatewayConfig,
    storage: Arc<dyn RequestStorage>,
}

impl GatewayProvider {
    /// Creates a gateway provider.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` for a zero timeout or if the
    /// HTTP client cannot be built.
    pub fn new(config: GatewayConfig, storage: Arc<dyn RequestStorage>) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(ReconcileError::configuration("gateway timeout must be greater than 0"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("Postback-Gateway/1.0")
            .build()
            .map_err(|e| {
                ReconcileError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config, storage })
    }

    fn reverse_endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.reverse.url.trim_end_matches('/'))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        endpoint: &GatewayEndpoint,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .basic_auth(&endpoint.username, Some(&endpoint.password))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReconcileError::provider(format!(
                        "gateway timed out after {}s",
                        self.config.timeout.as_secs()
                    ))
                } else {
                    ReconcileError::provider(format!("gateway unreachable: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReconcileError::provider(format!(
                "gateway answered {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ReconcileError::provider(format!("malformed gateway response: {e}")))
    }

    async fn record_success(&self, mut request: Request, receipt: ReverseReceipt) -> Result<()> {
        request.transition_to(RequestStatus::Used, None)?;
        request.retries = 0;
        request.postage_code = receipt.postage_code;
        if let Some(tracking_code) = receipt.tracking_code.filter(|c| !c.trim().is_empty()) {
            request.tracking_code = tracking_code;
        }

        self.storage.update_status(&request, RequestStatus::Used, None).await?;
        info!(
            request_id = %request.request_id,
            postage_code = %request.postage_code,
            "reverse operation accepted"
        );
        Ok(())
    }

    async fn record_failure(&self, mut request: Request, failure: &ReconcileError) -> Result<()> {
        let reason = failure.to_string();
        request.transition_to(RequestStatus::Error, Some(reason.clone()))?;
        request.retries = request.retries.saturating_add(1);

        self.storage.update_status(&request, RequestStatus::Error, Some(reason)).await?;
        warn!(
            request_id = %request.request_id,
            retries = request.retries,
            error = %failure,
            "reverse operation failed"
        );
        Ok(())
    }

    async fn apply_update(&self, update: ReverseUpdate) -> Result<Option<NotificationPayload>> {
        let Some(mut request) = self.storage.find_by_postage_code(&update.postage_code).await?
        else {
            return Err(ReconcileError::provider(format!(
                "update for unknown postage code {}",
                update.postage_code
            )));
        };

        let tracking_changed = match update.tracking_code.filter(|c| !c.trim().is_empty()) {
            Some(code) if code != request.tracking_code => {
                request.tracking_code = code;
                true
            },
            _ => false,
        };

        if update.status == request.status && !tracking_changed {
            debug!(request_id = %request.request_id, "reverse update changes nothing");
            return Ok(None);
        }

        if update.status != request.status {
            request.transition_to(update.status, update.reason.clone())?;
        }

        self.storage.update_status(&request, request.status, request.reason.clone()).await?;
        Ok(Some(NotificationPayload::from(&request)))
    }
}

impl ProviderHandler for GatewayProvider {
    fn track_objects(
        &self,
        query: &TrackingQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<TrackingObject>>> + Send + '_>> {
        let query = query.clone();
        let span = info_span!("gateway_track", objects = query.objects.len());

        Box::pin(
            async move {
                let tracking = &self.config.tracking;
                let request = self.client.post(&tracking.url).json(&query);
                let response: TrackingResponse = self.send_json(tracking, request).await?;
                debug!(returned = response.objects.len(), "tracking response received");
                Ok(response.objects)
            }
            .instrument(span),
        )
    }

    fn follow_reverse_logistic(
        &self,
        kind: ReverseKind,
    ) -> Pin<Box<dyn Future<Output = Vec<Result<NotificationPayload>>> + Send + '_>> {
        let span = info_span!("gateway_follow", kind = %kind);

        Box::pin(
            async move {
                let reverse = &self.config.reverse;
                let request =
                    self.client.get(self.reverse_endpoint("updates")).query(&[("kind", kind.code())]);
                let updates: Vec<ReverseUpdate> = match self.send_json(reverse, request).await {
                    Ok(updates) => updates,
                    Err(e) => return vec![Err(e)],
                };

                let mut results = Vec::with_capacity(updates.len());
                for update in updates {
                    match self.apply_update(update).await {
                        Ok(Some(payload)) => results.push(Ok(payload)),
                        Ok(None) => {},
                        Err(e) => results.push(Err(e)),
                    }
                }
                results
            }
            .instrument(span),
        )
    }

    fn do_reverse_logistic(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let span = info_span!(
            "gateway_reverse",
            request_id = %request.request_id,
            retries = request.retries
        );

        Box::pin(
            async move {
                let order = ReverseOrder {
                    request_id: request.request_id,
                    postage_code: &request.postage_code,
                    tracking_code: &request.tracking_code,
                };
                let call = self.client.post(self.reverse_endpoint("requests")).json(&order);

                match self.send_json::<ReverseReceipt>(&self.config.reverse, call).await {
                    Ok(receipt) => self.record_success(request, receipt).await,
                    Err(failure) => {
                        self.record_failure(request, &failure).await?;
                        Err(failure)
                    },
                }
            }
            .instrument(span),
        )
    }
}
