//! Core domain models for reverse-logistics request tracking.
//!
//! Provides the request entity and its status lifecycle, the provider-agnostic
//! filter model used to query requests, and the PostgreSQL repository that
//! owns persistence. The reconciliation crate depends on these types for
//! everything it reads from or writes to storage.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod filter;
pub mod models;
pub mod storage;

pub use error::{CoreError, Result};
pub use filter::{Field, FilterValue, Operator, Page, Predicate, Search};
pub use models::{NotificationPayload, Request, RequestId, RequestStatus, ReverseKind};
