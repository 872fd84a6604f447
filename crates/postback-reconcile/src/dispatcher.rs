//! Best-effort dispatch of requester notifications.

use std::sync::Arc;

use postback_core::models::NotificationPayload;
use tracing::{debug, warn};

use crate::{
    client::Notifier,
    pool::{TaskKind, TaskPool},
};

/// Hands notifications to the task pool without waiting for delivery.
///
/// Delivery errors are logged by the pool and dropped; a notification is
/// never retried.
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    pool: Arc<TaskPool>,
}

impl Dispatcher {
    /// Creates a dispatcher sending through `notifier` on `pool`.
    pub fn new(notifier: Arc<dyn Notifier>, pool: Arc<TaskPool>) -> Self {
        Self { notifier, pool }
    }

    /// Schedules one callback for `payload`.
    ///
    /// Returns whether the callback was scheduled. A closed pool drops the
    /// notification.
    pub async fn dispatch(&self, payload: NotificationPayload) -> bool {
        let notifier = self.notifier.clone();
        let label = format!("{} -> {}", payload.request_id, payload.status);
        let request_id = payload.request_id;

        match self
            .pool
            .submit(TaskKind::Notification, label, async move {
                notifier.notify(payload).await
            })
            .await
        {
            Ok(()) => {
                debug!(%request_id, "notification scheduled");
                true
            },
            Err(error) => {
                warn!(%request_id, error = %error, "notification dropped");
                false
            },
        }
    }

    /// Pool the callbacks run on.
    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }
}
