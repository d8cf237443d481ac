//! Push notification processor.

use super::{Message, Processor, QueuePayload};
use crate::error::RelayError;
use async_trait::async_trait;
use tracing::debug;

/// Consumes push notification messages from their queue.
///
/// Delivery to a push provider is not wired up; messages are acknowledged
/// so the queue drains, and anything else is rejected.
#[derive(Debug, Default)]
pub struct PushNotifier;

impl PushNotifier {
    /// Creates a notifier.
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Processor for PushNotifier {
    async fn process(&self, messages: Vec<Message>) -> Vec<(Message, RelayError)> {
        let mut failed = Vec::new();

        debug!(count = messages.len(), "push service processing messages");

        for mut message in messages {
            match &message.payload {
                QueuePayload::Push(_) => message.respond(Ok(serde_json::Value::Null)),
                QueuePayload::UserOp(_) => {
                    failed.push((message, RelayError::validation("invalid push message")));
                }
            }
        }

        failed
    }
}
