use async_trait::async_trait;
use futures::future::join_all;
use mender_core::Notification;
use tracing::{info, warn};

use crate::error::NotifyError;

/// Outbound notification sink.
///
/// Delivery is fire-and-forget from the engine's point of view: failures are
/// logged and never abort the workflow that produced the notification.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Deliver every notification concurrently, logging failures. Returns how
/// many succeeded.
pub async fn notify_all(
    notifier: &dyn Notifier,
    notifications: Vec<Notification>,
) -> usize {
    let deliveries = notifications.into_iter().map(|notification| async move {
        let recipient = notification.recipient_id.clone();
        let kind = notification.kind;
        match notifier.notify(notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    recipient_id = %recipient,
                    kind = kind.as_str(),
                    error = %e,
                    "notification delivery failed"
                );
                false
            }
        }
    });
    join_all(deliveries).await.into_iter().filter(|ok| *ok).count()
}

/// A notifier that logs each notification and performs no external I/O.
///
/// Used by the daemon when no delivery channel is wired in.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            organization_id = %notification.organization_id,
            recipient_id = %notification.recipient_id,
            kind = notification.kind.as_str(),
            title = %notification.title,
            "notification"
        );
        Ok(())
    }
}
