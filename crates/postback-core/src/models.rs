//! Core domain models and strongly-typed identifiers.
//!
//! Defines the reverse-logistics request, its status lifecycle, and the
//! payload handed to requesters when a request reaches a final outcome.
//! Includes database serialization traits for the identifier and status
//! types so repositories can bind them directly.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed request identifier.
///
/// Assigned by the request intake layer when a requester registers a
/// reverse shipment. Never reassigned; every status change and callback for
/// the request carries this ID.
///
/// # Example
///
/// ```
/// use postback_core::models::RequestId;
/// let request_id = RequestId::new();
/// println!("Tracking request: {}", request_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Creates a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for RequestId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RequestId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for RequestId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Request lifecycle status.
///
/// ```text
/// Created ──▶ Used ──▶ Delivered*
///    │         │  └──▶ FailedDelivery*
///    ▼         ▼
///  Error ◀─────┘
///    └──▶ Used (successful retry)
/// ```
///
/// `Delivered` and `FailedDelivery` are terminal: no further automatic
/// processing happens once a request reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Registered, reverse operation not yet performed with the provider.
    Created,

    /// Provider accepted the reverse operation; awaiting delivery
    /// confirmation from tracking.
    Used,

    /// Tracking confirmed final delivery.
    Delivered,

    /// Tracking reported the delivery could not be completed.
    FailedDelivery,

    /// Last provider operation failed; eligible for retry.
    Error,
}

impl RequestStatus {
    /// Returns the wire and database name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Used => "used",
            Self::Delivered => "delivered",
            Self::FailedDelivery => "failed_delivery",
            Self::Error => "error",
        }
    }

    /// Whether the status ends automatic processing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::FailedDelivery)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Error -> Error` is allowed so a failed retry can record its new
    /// reason and retry count.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Created => matches!(next, Self::Used | Self::Error),
            Self::Used => matches!(next, Self::Delivered | Self::FailedDelivery | Self::Error),
            Self::Error => matches!(
                next,
                Self::Used | Self::Error | Self::Delivered | Self::FailedDelivery
            ),
            Self::Delivered | Self::FailedDelivery => false,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "used" => Ok(Self::Used),
            "delivered" => Ok(Self::Delivered),
            "failed_delivery" => Ok(Self::FailedDelivery),
            "error" => Ok(Self::Error),
            _ => Err(CoreError::InvalidInput(format!("invalid request status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for RequestStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RequestStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|e: CoreError| e.to_string().into())
    }
}

impl sqlx::Encode<'_, PgDb> for RequestStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Kind of reverse-logistics operation followed up with the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReverseKind {
    /// Carrier collects the parcel at the requester's address.
    #[serde(rename = "C")]
    Collect,

    /// Requester drops the parcel at a post office with an authorization code.
    #[serde(rename = "A")]
    Postage,
}

impl ReverseKind {
    /// Provider code for the kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Collect => "C",
            Self::Postage => "A",
        }
    }
}

impl fmt::Display for ReverseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ReverseKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "C" => Ok(Self::Collect),
            "A" => Ok(Self::Postage),
            _ => Err(CoreError::InvalidInput(format!("invalid reverse kind: {s}"))),
        }
    }
}

/// Reverse-logistics shipment request.
///
/// Lives in storage and is mutated only through the repository's status
/// update. The reconciliation engine reads it, decides a transition, and
/// writes the result back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Request {
    /// Unique identifier for this request.
    pub request_id: RequestId,

    /// Postage authorization or collection number issued by the provider.
    pub postage_code: String,

    /// Object tracking code issued by the provider.
    ///
    /// Required for tracking polls; empty until the parcel is posted.
    pub tracking_code: String,

    /// Current lifecycle status.
    pub status: RequestStatus,

    /// Number of failed provider attempts.
    ///
    /// Reset to zero when the request reaches a terminal state or a retry
    /// succeeds.
    pub retries: i32,

    /// URL notified when the request reaches a final outcome.
    pub callback: String,

    /// Reason recorded with the latest transition.
    pub reason: Option<String>,

    /// When the request was registered.
    pub created_at: DateTime<Utc>,

    /// When the request was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Creates a request in the `Created` state.
    pub fn new(
        postage_code: impl Into<String>,
        tracking_code: impl Into<String>,
        callback: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: RequestId::new(),
            postage_code: postage_code.into(),
            tracking_code: tracking_code.into(),
            status: RequestStatus::Created,
            retries: 0,
            callback: callback.into(),
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the request to `next`, enforcing the lifecycle.
    ///
    /// Terminal transitions and `Error -> Used` reset `retries` to zero.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the lifecycle forbids the move.
    pub fn transition_to(&mut self, next: RequestStatus, reason: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidInput(format!(
                "request {} cannot move from {} to {}",
                self.request_id, self.status, next
            )));
        }

        if next.is_terminal() || (self.status == RequestStatus::Error && next == RequestStatus::Used)
        {
            self.retries = 0;
        }

        self.status = next;
        self.reason = reason;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Body of the callback sent to a requester.
///
/// Built when a request becomes terminal or is escalated at the retry
/// ceiling. Not persisted and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    /// Request the outcome belongs to.
    pub request_id: RequestId,

    /// Provider postage code.
    pub postage_code: String,

    /// Provider tracking code.
    pub tracking_code: String,

    /// Status being reported.
    pub status: RequestStatus,

    /// Destination URL for the callback.
    pub callback: String,
}

impl From<&Request> for NotificationPayload {
    fn from(request: &Request) -> Self {
        Self {
            request_id: request.request_id,
            postage_code: request.postage_code.clone(),
            tracking_code: request.tracking_code.clone(),
            status: request.status,
            callback: request.callback.clone(),
        }
    }
}
