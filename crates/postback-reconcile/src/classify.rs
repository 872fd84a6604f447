//! Classification of tracking events into delivery outcomes.
//!
//! The provider reports each event as a delivery-type classifier plus a
//! status code. Only the most recent event decides the outcome.

use crate::provider::{TrackingEvent, TrackingObject};

/// Event types that describe a final delivery attempt.
const FINAL_DELIVERY_TYPES: &[&str] = &["BDE", "BDI", "BDR"];

/// Status codes meaning the object reached the recipient.
const DELIVERED_CODES: &[&str] = &["00", "01"];

/// Status codes meaning delivery failed, with the reason reported to the
/// requester.
const FAILED_DELIVERY_REASONS: &[(&str, &str)] = &[
    ("02", "recipient absent"),
    ("03", "object not claimed by recipient"),
    ("04", "recipient refused the object"),
    ("05", "recipient moved"),
    ("06", "recipient unknown at address"),
    ("07", "incorrect address"),
    ("08", "address not found"),
    ("09", "object lost in transit"),
    ("10", "delivery not possible"),
];

/// Outcome implied by an object's most recent tracking event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Final delivery confirmed.
    Delivered,
    /// Delivery failed for the given reason.
    Failed {
        /// Reason derived from the status code.
        reason: &'static str,
    },
    /// Still in transit or not yet conclusive.
    Pending,
}

/// Whether the event type describes a final delivery attempt.
pub fn is_final_delivery_type(event_type: &str) -> bool {
    let event_type = event_type.trim();
    FINAL_DELIVERY_TYPES.iter().any(|final_type| *final_type == event_type)
}

/// Reason for a failed-delivery status code, if the code is one.
pub fn failure_reason(status: &str) -> Option<&'static str> {
    let status = status.trim();
    FAILED_DELIVERY_REASONS.iter().find(|(code, _)| *code == status).map(|(_, reason)| *reason)
}

/// Classifies a single event.
///
/// A delivered status only counts under a final delivery type; a failed
/// status counts under any type.
pub fn classify_event(event: &TrackingEvent) -> Classification {
    let status = event.status.trim();
    if is_final_delivery_type(&event.event_type) && DELIVERED_CODES.iter().any(|c| *c == status) {
        return Classification::Delivered;
    }

    match failure_reason(&event.status) {
        Some(reason) => Classification::Failed { reason },
        None => Classification::Pending,
    }
}

/// Classifies an object by its most recent event.
pub fn classify(object: &TrackingObject) -> Classification {
    object.latest().map_or(Classification::Pending, classify_event)
}
