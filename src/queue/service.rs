//! A named bounded queue with retry accounting and back-pressure.

use super::Message;
use crate::{error::RelayError, metrics::QueueMetrics};
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A batched message processor.
///
/// One `process` call is in flight per queue at any time; processors rely
/// on this for per-key sequencing. Messages that could not be handled come
/// back paired with their error so the queue can retry or drop them.
#[async_trait]
pub trait Processor: Send + Sync {
    /// The natural batch size for one `process` invocation.
    fn batch_size(&self) -> usize {
        10
    }

    /// Handles a batch. Returns the messages that failed, each with the
    /// error that felled it. Successful messages are responded to and
    /// consumed by the processor.
    async fn process(&self, messages: Vec<Message>) -> Vec<(Message, RelayError)>;
}

/// Enqueue side of a queue. Cheap to clone.
#[derive(Clone)]
pub struct QueueHandle {
    name: String,
    tx: mpsc::Sender<Message>,
    inflight: Arc<DashSet<String>>,
    error_tx: mpsc::UnboundedSender<RelayError>,
    metrics: Arc<QueueMetrics>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle").field("name", &self.name).finish_non_exhaustive()
    }
}

impl QueueHandle {
    /// Enqueues a message without blocking.
    ///
    /// Duplicate identities are rejected, a full buffer fails with
    /// [`RelayError::QueueFull`], and crossing the 90% high-water mark
    /// emits a warning on the error channel.
    pub fn enqueue(&self, mut message: Message) -> Result<(), RelayError> {
        if !self.inflight.insert(message.id.clone()) {
            let err = RelayError::DuplicateMessage(message.id.clone());
            message.respond(Err(RelayError::DuplicateMessage(message.id.clone())));
            return Err(err);
        }

        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(mut message)) => {
                self.inflight.remove(&message.id);
                message.respond(Err(RelayError::QueueFull(self.name.clone())));
                let _ = self.error_tx.send(RelayError::QueueFull(self.name.clone()));
                return Err(RelayError::QueueFull(self.name.clone()));
            }
            Err(TrySendError::Closed(mut message)) => {
                self.inflight.remove(&message.id);
                message.respond(Err(RelayError::RequestTimeout));
                return Err(RelayError::QueueFull(self.name.clone()));
            }
        }

        self.metrics.queued.increment(1);

        let occupancy = self.tx.max_capacity() - self.tx.capacity();
        if occupancy * 10 >= self.tx.max_capacity() * 9 {
            let _ = self.error_tx.send(RelayError::QueueAlmostFull(self.name.clone()));
        }

        Ok(())
    }
}

/// The worker side of a queue: drains batches into a [`Processor`] and
/// handles retries.
#[derive(Debug)]
pub struct QueueService {
    name: String,
    max_retries: u32,
    rx: mpsc::Receiver<Message>,
    handle: QueueHandle,
    error_tx: mpsc::UnboundedSender<RelayError>,
    cancel: CancellationToken,
}

impl QueueService {
    /// Creates a queue. Returns the worker, the enqueue handle and the
    /// channel capacity/processing errors surface on.
    pub fn new(
        name: impl Into<String>,
        max_retries: u32,
        buffer: usize,
        cancel: CancellationToken,
    ) -> (Self, QueueHandle, mpsc::UnboundedReceiver<RelayError>) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(buffer);
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let handle = QueueHandle {
            name: name.clone(),
            tx,
            inflight: Arc::new(DashSet::new()),
            error_tx: error_tx.clone(),
            metrics: Arc::new(QueueMetrics::default()),
        };

        let service = Self { name, max_retries, rx, handle: handle.clone(), error_tx, cancel };

        (service, handle, error_rx)
    }

    /// Runs the worker until cancellation, then drains what is left.
    pub async fn start<P: Processor>(mut self, processor: P) {
        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
            };

            self.process_batch(&processor, first).await;
        }

        // Graceful drain: everything already queued still gets one pass.
        while let Ok(message) = self.rx.try_recv() {
            self.process_batch(&processor, message).await;
        }
        debug!(queue = %self.name, "queue worker stopped");
    }

    async fn process_batch<P: Processor>(&mut self, processor: &P, first: Message) {
        let mut batch = vec![first];
        while batch.len() < processor.batch_size() {
            match self.rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        let mut ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
        self.handle.metrics.processed.increment(batch.len() as u64);

        let failed = processor.process(batch).await;

        for (mut message, err) in failed {
            if err.is_retryable() && message.retry_count < self.max_retries {
                message.retry_count += 1;
                debug!(queue = %self.name, id = %message.id, retry = message.retry_count,
                    "re-enqueueing message");
                ids.retain(|id| id != &message.id);
                // Bypasses the handle: the identity is still tracked as
                // in flight.
                if let Err(mpsc::error::TrySendError::Full(mut message)
                | mpsc::error::TrySendError::Closed(mut message)) =
                    self.handle.tx.try_send(message)
                {
                    warn!(queue = %self.name, id = %message.id, "dropping retry, queue unavailable");
                    ids.push(message.id.clone());
                    message.respond(Err(RelayError::QueueFull(self.name.clone())));
                    let _ = self.error_tx.send(RelayError::QueueFull(self.name.clone()));
                }
            } else {
                warn!(queue = %self.name, id = %message.id, %err, "dropping message");
                self.handle.metrics.dropped.increment(1);
                let _ = self.error_tx.send(RelayError::Validation(err.to_string()));
                message.respond(Err(err));
            }
        }

        // Everything not re-enqueued reached a terminal state.
        for id in ids {
            self.handle.inflight.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Message, QueuePayload};
    use crate::types::{UserOpMessage, UserOperation};
    use alloy::primitives::{Address, Bytes};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn userop_message(tag: u8) -> Message {
        let userop = UserOpMessage {
            paymaster: Address::ZERO,
            entry_point: Address::ZERO,
            chain_id: 1,
            userop: UserOperation {
                signature: Bytes::from(vec![tag]),
                ..Default::default()
            },
            data: None,
            extra_data: None,
            bump_gas: 0,
        };
        Message::new(userop.identity(), QueuePayload::UserOp(userop))
    }

    #[derive(Debug, Default)]
    struct CountingProcessor {
        processed: AtomicUsize,
        fail_pushes: bool,
    }

    #[async_trait]
    impl Processor for CountingProcessor {
        async fn process(&self, messages: Vec<Message>) -> Vec<(Message, RelayError)> {
            let mut failed = Vec::new();
            for mut message in messages {
                self.processed.fetch_add(1, Ordering::SeqCst);
                match &message.payload {
                    QueuePayload::UserOp(_) => message.respond(Ok(serde_json::json!("ok"))),
                    QueuePayload::Push(_) if self.fail_pushes => {
                        failed.push((message, RelayError::validation("invalid message")));
                    }
                    QueuePayload::Push(_) => message.respond(Ok(serde_json::json!("ok"))),
                }
            }
            failed
        }
    }

    #[tokio::test]
    async fn processes_all_messages() {
        let cancel = CancellationToken::new();
        let (service, handle, _errors) = QueueService::new("tx", 3, 10, cancel.clone());
        let processor = Arc::new(CountingProcessor::default());

        for i in 0..6 {
            handle.enqueue(userop_message(i)).unwrap();
        }

        let worker = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                service
                    .start(ForwardingProcessor(processor))
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(processor.processed.load(Ordering::SeqCst), 6);
    }

    /// Wraps an `Arc<CountingProcessor>` so the test keeps a handle on the
    /// counters.
    struct ForwardingProcessor(Arc<CountingProcessor>);

    #[async_trait]
    impl Processor for ForwardingProcessor {
        async fn process(&self, messages: Vec<Message>) -> Vec<(Message, RelayError)> {
            self.0.process(messages).await
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_identities() {
        let cancel = CancellationToken::new();
        let (_service, handle, _errors) = QueueService::new("tx", 3, 10, cancel);

        handle.enqueue(userop_message(1)).unwrap();
        let err = handle.enqueue(userop_message(1)).unwrap_err();
        assert!(matches!(err, RelayError::DuplicateMessage(_)));

        // A different op is still accepted.
        handle.enqueue(userop_message(2)).unwrap();
    }

    #[tokio::test]
    async fn rejects_when_full_and_warns_near_capacity() {
        let cancel = CancellationToken::new();
        let (_service, handle, mut errors) = QueueService::new("tx", 3, 2, cancel);

        handle.enqueue(userop_message(1)).unwrap();
        handle.enqueue(userop_message(2)).unwrap();
        let err = handle.enqueue(userop_message(3)).unwrap_err();
        assert!(matches!(err, RelayError::QueueFull(_)));

        // Filling the buffer crossed the high-water mark first.
        let mut saw_almost_full = false;
        let mut saw_full = false;
        while let Ok(err) = errors.try_recv() {
            match err {
                RelayError::QueueAlmostFull(_) => saw_almost_full = true,
                RelayError::QueueFull(_) => saw_full = true,
                _ => {}
            }
        }
        assert!(saw_almost_full);
        assert!(saw_full);
    }

    #[tokio::test]
    async fn drops_non_retryable_failures() {
        let cancel = CancellationToken::new();
        let (service, handle, mut errors) = QueueService::new("push", 3, 10, cancel.clone());

        handle
            .enqueue(Message::new("push:1", QueuePayload::Push(serde_json::json!({}))))
            .unwrap();

        let processor = Arc::new(CountingProcessor { fail_pushes: true, ..Default::default() });
        let worker = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move { service.start(ForwardingProcessor(processor)).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        worker.await.unwrap();

        // Validation errors are not retryable: processed exactly once and
        // surfaced on the error channel.
        assert_eq!(processor.processed.load(Ordering::SeqCst), 1);
        assert!(matches!(errors.try_recv(), Ok(RelayError::Validation(_))));

        // The identity is free again after the drop.
        handle
            .enqueue(Message::new("push:1", QueuePayload::Push(serde_json::json!({}))))
            .unwrap();
    }
}
