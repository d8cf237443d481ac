//! Relay error types.

use alloy::transports::{RpcError, TransportErrorKind};
use thiserror::Error;

/// Errors produced by the event store and the key/registry tables.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("not found")]
    NotFound,
    /// A database error occurred.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// Key material could not be encrypted or decrypted.
    #[error("key material error: {0}")]
    Crypt(String),
    /// A stored payload could not be (de)serialized.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// An event failed signing or verification on its way into the store.
    #[error("event error: {0}")]
    Event(String),
}

/// The relay overarching error type.
///
/// The variants are a closed set: callers match on the kind to decide
/// between rejecting, retrying and crashing.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The request failed validation. Reported to the caller verbatim and
    /// never retried.
    #[error("{0}")]
    Validation(String),
    /// A transient upstream RPC failure. Safe to retry.
    #[error(transparent)]
    TransientRpc(#[from] RpcError<TransportErrorKind>),
    /// The node asked for the transaction to be replaced (code -32010).
    /// The batch is re-enqueued with bumped fee caps.
    #[error("transaction replacement requested")]
    ReplacementRequested,
    /// Fee bumping hit the cap without the replacement being accepted.
    #[error("replacement attempts exhausted after {0} bumps")]
    ReplacementExhausted(u8),
    /// The queue rejected the message because its buffer is full.
    #[error("queue {0} is full")]
    QueueFull(String),
    /// The queue buffer crossed its high-water mark. Surfaced on the error
    /// channel as an operator warning; the message itself was accepted.
    #[error("queue {0} is almost full")]
    QueueAlmostFull(String),
    /// A message with the same identity is already queued.
    #[error("message {0} is already queued")]
    DuplicateMessage(String),
    /// The caller gave up waiting for the queue to respond.
    #[error("request timeout")]
    RequestTimeout,
    /// Invalid deployment configuration. Fatal at startup.
    #[error("configuration: {0}")]
    Config(String),
    /// A persistence failure. Fatal: bubbled to the quit channel so a
    /// supervisor can restart the process.
    #[error(transparent)]
    Store(#[from] StorageError),
}

impl RelayError {
    /// Creates a [`RelayError::Validation`] from a user-visible reason.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Whether the queue should re-enqueue a message that failed with this
    /// error instead of dropping it.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRpc(_) | Self::ReplacementRequested)
    }
}

impl From<alloy::sol_types::Error> for RelayError {
    fn from(err: alloy::sol_types::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
