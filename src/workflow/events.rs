use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

type MailboxKey = (String, String);

/// Wakes instances suspended on a named external event.
///
/// Payloads live in the durable inbox; a mailbox only signals that the inbox
/// changed. `Notify::notify_one` stores a permit when nobody is waiting, so a
/// signal raised before the wait starts is not lost.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    mailboxes: Arc<Mutex<HashMap<MailboxKey, Arc<Notify>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailbox for one (instance, event name) pair, created on first use
    pub async fn mailbox(&self, instance_id: &str, name: &str) -> Arc<Notify> {
        let mut mailboxes = self.mailboxes.lock().await;
        mailboxes
            .entry((instance_id.to_string(), name.to_string()))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub async fn signal(&self, instance_id: &str, name: &str) {
        debug!(instance_id = %instance_id, event = %name, "Signalling mailbox");
        self.mailbox(instance_id, name).await.notify_one();
    }

    /// Drop every mailbox belonging to a finished instance
    pub async fn close_instance(&self, instance_id: &str) {
        self.mailboxes
            .lock()
            .await
            .retain(|(owner, _), _| owner != instance_id);
    }

    pub async fn mailbox_count(&self) -> usize {
        self.mailboxes.lock().await.len()
    }
}
