//! Durable work queues backing the bundler and push notifier.

mod service;
pub use service::{Processor, QueueHandle, QueueService};

mod bundler;
pub use bundler::UserOpBundler;

mod push;
pub use push::PushNotifier;

use crate::{constants::RESPONSE_TIMEOUT, error::RelayError, types::UserOpMessage};
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// The payload carried by a queued [`Message`].
#[derive(Debug)]
pub enum QueuePayload {
    /// A user operation awaiting bundling.
    UserOp(UserOpMessage),
    /// A push notification awaiting delivery.
    Push(serde_json::Value),
}

/// A queue envelope: payload plus identity, retry accounting and an
/// optional response sink back to the waiting caller.
#[derive(Debug)]
pub struct Message {
    /// Deduplication identity within the queue.
    pub id: String,
    /// When the message was first enqueued.
    pub created_at: DateTime<Utc>,
    /// How many times the queue has re-enqueued this message.
    pub retry_count: u32,
    /// The work itself.
    pub payload: QueuePayload,
    response: Option<oneshot::Sender<Result<serde_json::Value, RelayError>>>,
}

impl Message {
    /// Wraps a payload with a fresh identity and no response sink.
    pub fn new(id: impl Into<String>, payload: QueuePayload) -> Self {
        Self { id: id.into(), created_at: Utc::now(), retry_count: 0, payload, response: None }
    }

    /// Wraps a user operation, returning the message and the handle the
    /// caller blocks on.
    pub fn for_userop(userop: UserOpMessage) -> (Self, ResponseHandle) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            id: userop.identity(),
            created_at: Utc::now(),
            retry_count: 0,
            payload: QueuePayload::UserOp(userop),
            response: Some(tx),
        };
        (message, ResponseHandle { rx })
    }

    /// Delivers the terminal outcome to the waiting caller, if any.
    ///
    /// The consumer may have timed out and dropped its receiver; that is
    /// fine, the send result is intentionally discarded.
    pub fn respond(&mut self, outcome: Result<serde_json::Value, RelayError>) {
        if let Some(tx) = self.response.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// The caller side of a queued message's response channel.
#[derive(Debug)]
pub struct ResponseHandle {
    rx: oneshot::Receiver<Result<serde_json::Value, RelayError>>,
}

impl ResponseHandle {
    /// Waits for the queue to resolve the message, bounded so a stuck queue
    /// cannot hold the request forever.
    pub async fn wait(self) -> Result<serde_json::Value, RelayError> {
        match tokio::time::timeout(RESPONSE_TIMEOUT, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without responding: the message was lost.
            Ok(Err(_)) => Err(RelayError::RequestTimeout),
            Err(_) => Err(RelayError::RequestTimeout),
        }
    }
}
