//! Test doubles shared by handler and engine tests.

use std::collections::HashSet;

use async_trait::async_trait;
use mender_core::{Notification, NotificationKind};
use parking_lot::Mutex;

use crate::error::NotifyError;
use crate::notifier::Notifier;

/// A notifier that records every delivered notification.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: HashSet<String>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject deliveries addressed to `recipient`.
    #[must_use]
    pub fn failing_for(mut self, recipient: &str) -> Self {
        self.failing.insert(recipient.to_owned());
        self
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|n| n.recipient_id.to_string())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        if self.failing.contains(notification.recipient_id.as_str()) {
            return Err(NotifyError::Delivery(format!(
                "mailbox for {} unavailable",
                notification.recipient_id
            )));
        }
        self.sent.lock().push(notification);
        Ok(())
    }
}
