//! Relay storage api.

use crate::{
    error::StorageError,
    types::{Event, Sponsor},
};
use async_trait::async_trait;
use nostr::{Event as NostrEvent, Filter};
use std::fmt::Debug;

/// Type alias for `Result<T, StorageError>`
pub type Result<T> = core::result::Result<T, StorageError>;

/// Storage API: the signed-event index plus the relay's three small tables
/// (sponsor keys, the event registry, pending log descriptions).
#[async_trait]
pub trait StorageApi: Debug + Send + Sync {
    /// Prepares the schema. No-op for backends without one.
    async fn migrate(&self) -> Result<()>;

    /// Persists a signed event. Saving an event whose id already exists is
    /// an idempotent no-op.
    async fn save_event(&self, event: &NostrEvent) -> Result<()>;

    /// Persists a replaceable event, superseding any previous event with
    /// the same `(kind, author, d tag)`.
    async fn save_replaceable_event(&self, event: &NostrEvent) -> Result<()>;

    /// Queries stored events by filter, newest first.
    async fn query_events(&self, filter: Filter) -> Result<Vec<NostrEvent>>;

    /// Counts stored events matching the filter.
    async fn count_events(&self, filter: Filter) -> Result<usize>;

    /// Deletes an event by id.
    async fn delete_event(&self, event_id: &str) -> Result<()>;

    /// Finds the log event for a content hash on a chain (`d` + `t` tags).
    async fn get_log_event(&self, chain_id: &str, hash: &str) -> Result<Option<NostrEvent>>;

    /// Pages through log events for a contract/topic pair, newest first.
    async fn list_log_events(
        &self,
        contract: &str,
        topic: &str,
        max_created_at: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<NostrEvent>>;

    /// Finds the kind-1 mention note referencing an event id, if any.
    async fn get_mention_event(&self, event_id: &str) -> Result<Option<NostrEvent>>;

    /// Reads a sponsor by paymaster contract address, with the key
    /// decrypted. Callers never see ciphertext.
    async fn get_sponsor(&self, contract: &str) -> Result<Sponsor>;

    /// Adds a sponsor, encrypting the key at rest.
    async fn add_sponsor(&self, sponsor: &Sponsor) -> Result<()>;

    /// Rotates a sponsor's key.
    async fn update_sponsor(&self, sponsor: &Sponsor) -> Result<()>;

    /// Registers an indexed event. Upserts on `(chain_id, contract, topic)`.
    async fn register_event(&self, event: &Event) -> Result<()>;

    /// Whether any event is registered for the contract on the chain.
    async fn event_exists(&self, chain_id: &str, contract: &str) -> Result<bool>;

    /// Reads a registered event.
    async fn get_event(&self, chain_id: &str, contract: &str, topic: &str) -> Result<Event>;

    /// Lists registered events for a chain, oldest first.
    async fn list_events(&self, chain_id: &str) -> Result<Vec<Event>>;

    /// Stores a description blob waiting for its log to be indexed.
    async fn upsert_pending_data(&self, hash: &str, data: &serde_json::Value) -> Result<()>;

    /// Reads a pending description blob.
    async fn get_pending_data(&self, hash: &str) -> Result<Option<serde_json::Value>>;

    /// Drops a pending description blob.
    async fn delete_pending_data(&self, hash: &str) -> Result<()>;

    /// Pings the backend, checking the connection is alive.
    async fn ping(&self) -> Result<()>;
}
