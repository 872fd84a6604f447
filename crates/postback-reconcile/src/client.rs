//! HTTP client for requester callbacks.
//!
//! Sends one JSON POST per notification. Connections are not reused between
//! callbacks and every request carries its own timeout, so a slow requester
//! can hold at most one connection for a bounded time.

use std::{future::Future, pin::Pin, time::Duration};

use postback_core::models::NotificationPayload;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{ReconcileError, Result};

/// Content type sent with every callback.
pub const CALLBACK_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Configuration for the callback client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a single callback request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_NOTIFICATION_TIMEOUT_SECONDS),
            user_agent: "Postback-Callback/1.0".to_string(),
        }
    }
}

/// Outcome of a callback request that reached the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

/// Sends notification payloads to requesters.
pub trait Notifier: Send + Sync + 'static {
    /// Delivers one payload to `payload.callback`.
    fn notify(
        &self,
        payload: NotificationPayload,
    ) -> Pin<Box<dyn Future<Output = Result<CallbackResponse>> + Send + '_>>;
}

/// Parses a callback URL, accepting only `http` and `https`.
///
/// # Errors
///
/// Returns `ReconcileError::InvalidCallback` for unparseable URLs and other
/// schemes.
pub fn parse_callback_url(callback: &str) -> Result<Url> {
    let url = Url::parse(callback.trim())
        .map_err(|e| ReconcileError::invalid_callback(callback, e.to_string()))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ReconcileError::invalid_callback(
            callback,
            format!("unsupported scheme {other}"),
        )),
    }
}

/// Whether a callback must be sent with certificate verification.
///
/// True for `https`. Plain `http` has no certificate to verify.
pub fn requires_tls_verification(url: &Url) -> bool {
    url.scheme() == "https"
}

/// HTTP client for requester callbacks.
///
/// Certificate verification stays enabled for every request; idle
/// connections are never kept, so each callback opens a fresh connection and
/// closes it after the response. Redirects are not followed: a callback is
/// one POST to the stored URL, and a 3xx answer is reported like any other
/// status.
#[derive(Debug, Clone)]
pub struct CallbackClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl CallbackClient {
    /// Creates a new callback client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .danger_accept_invalid_certs(false)
            .build()
            .map_err(|e| {
                ReconcileError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new callback client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Posts a payload to its callback URL.
    ///
    /// Any HTTP status counts as delivered; the response body is not read.
    ///
    /// # Errors
    ///
    /// - `InvalidCallback` for unusable URLs
    /// - `Timeout` when the request exceeds the configured timeout
    /// - `Network` for connection and transport failures
    pub async fn post(&self, payload: &NotificationPayload) -> Result<CallbackResponse> {
        let url = parse_callback_url(&payload.callback)?;
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "callback",
            request_id = %payload.request_id,
            status = %payload.status,
            url = %url,
            verify_tls = requires_tls_verification(&url)
        );

        async move {
            let body = serde_json::to_vec(payload).map_err(|e| {
                ReconcileError::internal(format!("failed to serialize payload: {e}"))
            })?;

            let response = match self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, CALLBACK_CONTENT_TYPE)
                .header(reqwest::header::CONNECTION, "close")
                .body(body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "callback failed: {}", e);

                    if e.is_timeout() {
                        return Err(ReconcileError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(ReconcileError::network(format!("connection failed: {e}")));
                    }
                    return Err(ReconcileError::network(e.to_string()));
                },
            };

            let status = response.status();
            let duration = start_time.elapsed();

            if status.is_success() {
                tracing::info!(
                    status = status.as_u16(),
                    duration_ms = duration.as_millis(),
                    "callback delivered"
                );
            } else {
                tracing::warn!(
                    status = status.as_u16(),
                    duration_ms = duration.as_millis(),
                    "callback answered with non-success status"
                );
            }

            Ok(CallbackResponse { status_code: status.as_u16(), is_success: status.is_success() })
        }
        .instrument(span)
        .await
    }
}

impl Notifier for CallbackClient {
    fn notify(
        &self,
        payload: NotificationPayload,
    ) -> Pin<Box<dyn Future<Output = Result<CallbackResponse>> + Send + '_>> {
        Box::pin(async move { self.post(&payload).await })
    }
}

/// Notifier double for tests.
pub mod mock {
    use tokio::sync::RwLock;

    use super::*;

    /// Records every payload and answers with 200.
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: RwLock<Vec<NotificationPayload>>,
        failing_callbacks: RwLock<Vec<String>>,
    }

    impl RecordingNotifier {
        /// Creates a notifier with nothing recorded.
        pub fn new() -> Self {
            Self::default()
        }

        /// Payloads notified so far, including failed ones.
        pub async fn sent(&self) -> Vec<NotificationPayload> {
            self.sent.read().await.clone()
        }

        /// Makes notifications to `callback` fail with a network error.
        pub async fn fail_callback(&self, callback: impl Into<String>) {
            self.failing_callbacks.write().await.push(callback.into());
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(
            &self,
            payload: NotificationPayload,
        ) -> Pin<Box<dyn Future<Output = Result<CallbackResponse>> + Send + '_>> {
            Box::pin(async move {
                let fails = self.failing_callbacks.read().await.contains(&payload.callback);
                let callback = payload.callback.clone();
                self.sent.write().await.push(payload);

                if fails {
                    return Err(ReconcileError::network(format!("connection refused: {callback}")));
                }
                Ok(CallbackResponse { status_code: 200, is_success: true })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use postback_core::models::{RequestId, RequestStatus};
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn payload(callback: String) -> NotificationPayload {
        NotificationPayload {
            request_id: RequestId::new(),
            postage_code: "1234567890".to_string(),
            tracking_code: "SS123456789BR".to_string(),
            status: RequestStatus::Delivered,
            callback,
        }
    }

    #[tokio::test]
    async fn posts_json_payload_with_charset_content_type() {
        let mock_server = MockServer::start().await;
        let payload = payload(format!("{}/hooks/reverse", mock_server.uri()));

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hooks/reverse"))
            .and(matchers::header("content-type", CALLBACK_CONTENT_TYPE))
            .and(matchers::body_json(serde_json::json!({
                "requestId": payload.request_id.to_string(),
                "postageCode": "1234567890",
                "trackingCode": "SS123456789BR",
                "status": "delivered",
                "callback": payload.callback,
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = CallbackClient::with_defaults().unwrap();
        let response = client.post(&payload).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
    }

    #[tokio::test]
    async fn requests_connection_close() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header("connection", "close"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = CallbackClient::with_defaults().unwrap();
        let response = client.post(&payload(mock_server.uri())).await.unwrap();
        assert_eq!(response.status_code, 204);
    }

    #[tokio::test]
    async fn non_success_status_is_reported_not_failed() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let client = CallbackClient::with_defaults().unwrap();
        let response = client.post(&payload(mock_server.uri())).await.unwrap();

        assert_eq!(response.status_code, 500);
        assert!(!response.is_success);
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/old"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("{}/new", mock_server.uri())),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(matchers::path("/new"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let client = CallbackClient::with_defaults().unwrap();
        let response =
            client.post(&payload(format!("{}/old", mock_server.uri()))).await.unwrap();

        assert_eq!(response.status_code, 302);
        assert!(!response.is_success);
    }

    #[tokio::test]
    async fn slow_requester_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = CallbackClient::new(ClientConfig {
            timeout: Duration::from_millis(100),
            ..ClientConfig::default()
        })
        .unwrap();

        let error = client.post(&payload(mock_server.uri())).await.unwrap_err();
        assert!(matches!(error, ReconcileError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unreachable_requester_is_network_error() {
        let client = CallbackClient::with_defaults().unwrap();
        let error = client.post(&payload("http://127.0.0.1:1/cb".to_string())).await.unwrap_err();
        assert!(matches!(error, ReconcileError::Network { .. }));
    }

    #[tokio::test]
    async fn invalid_callback_is_rejected_before_io() {
        let client = CallbackClient::with_defaults().unwrap();

        let error = client.post(&payload("not a url".to_string())).await.unwrap_err();
        assert!(matches!(error, ReconcileError::InvalidCallback { .. }));

        let error = client.post(&payload("ftp://example.com/cb".to_string())).await.unwrap_err();
        assert!(matches!(error, ReconcileError::InvalidCallback { .. }));
    }

    #[test]
    fn tls_verification_required_for_https_only() {
        let https = parse_callback_url("https://example.com/cb").unwrap();
        let upper = parse_callback_url("HTTPS://example.com/cb").unwrap();
        let http = parse_callback_url("http://example.com/cb").unwrap();

        assert!(requires_tls_verification(&https));
        assert!(requires_tls_verification(&upper));
        assert!(!requires_tls_verification(&http));
    }
}
