//! Approval notifications. Delivery is best-effort: a failed notification is
//! logged and journaled but never fails the stage.

use async_trait::async_trait;
use tracing::info;

use crate::model::Contact;

/// Delivers a message to a contact.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, contact: &Contact, message: &str) -> anyhow::Result<()>;
}

/// Notifier that only emits a structured log line per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, contact: &Contact, message: &str) -> anyhow::Result<()> {
        info!(event = "approval.notify", contact = %contact, message = %message);
        Ok(())
    }
}
