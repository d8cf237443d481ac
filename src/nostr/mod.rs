//! Nostr surface: event authoring, the relay endpoint and group
//! enforcement.

pub mod groups;
pub mod relay;

use crate::{
    constants::{KIND_TX_LOG, KIND_USER_OP},
    error::StorageError,
    storage::RelayStorage,
    types::{Log, UserOpMessage},
};
use nostr::{Event as NostrEvent, EventBuilder, Keys, Kind, Tag};

/// Returns the first value of the named tag, e.g. `tag_value(ev, "h")`.
pub fn tag_value<'a>(event: &'a NostrEvent, name: &'a str) -> Option<&'a str> {
    tag_values(event, name).next()
}

/// Iterates the first values of every occurrence of the named tag.
pub fn tag_values<'a>(event: &'a NostrEvent, name: &'a str) -> impl Iterator<Item = &'a str> {
    event.tags.iter().filter_map(move |tag| {
        let slice = tag.as_slice();
        (slice.first().map(String::as_str) == Some(name))
            .then(|| slice.get(1).map(String::as_str))
            .flatten()
    })
}

/// Returns every `p` tag as `[pubkey, role?]`.
pub fn p_tags(event: &NostrEvent) -> Vec<(String, Option<String>)> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let slice = tag.as_slice();
            if slice.first().map(String::as_str) != Some("p") {
                return None;
            }
            let pubkey = slice.get(1)?.clone();
            Some((pubkey, slice.get(2).cloned()))
        })
        .collect()
}

fn tag(parts: &[&str]) -> Result<Tag, StorageError> {
    Tag::parse(parts.iter().copied()).map_err(|err| StorageError::Event(err.to_string()))
}

/// Signs relay-authored events and writes them to the event store.
#[derive(Debug, Clone)]
pub struct NostrService {
    keys: Keys,
    storage: RelayStorage,
    /// Public URL of this relay, referenced from authored notes.
    pub relay_url: String,
}

impl NostrService {
    /// Creates a service signing with `keys` and persisting into `storage`.
    pub fn new(keys: Keys, storage: RelayStorage, relay_url: impl Into<String>) -> Self {
        Self { keys, storage, relay_url: relay_url.into() }
    }

    /// The relay's own public key.
    pub fn public_key(&self) -> nostr::PublicKey {
        self.keys.public_key()
    }

    /// The relay's own public key, hex encoded.
    pub fn public_key_hex(&self) -> String {
        self.keys.public_key().to_hex()
    }

    /// Signs an event and saves it. Duplicate ids are idempotent no-ops.
    pub async fn sign_and_save(&self, builder: EventBuilder) -> Result<NostrEvent, StorageError> {
        let event = builder
            .sign_with_keys(&self.keys)
            .map_err(|err| StorageError::Event(err.to_string()))?;
        self.storage.save_event(&event).await?;
        Ok(event)
    }

    /// Signs a replaceable event and saves it, superseding the previous
    /// `(kind, author, d)` entry.
    pub async fn sign_and_save_replaceable(
        &self,
        builder: EventBuilder,
    ) -> Result<NostrEvent, StorageError> {
        let event = builder
            .sign_with_keys(&self.keys)
            .map_err(|err| StorageError::Event(err.to_string()))?;
        self.storage.save_replaceable_event(&event).await?;
        Ok(event)
    }

    /// Builds the log event for a decoded chain log: content is the log
    /// JSON, tags address it by contract (`p`), chain (`t`), content hash
    /// (`d`) and topic0.
    pub fn tx_log_event(
        &self,
        log: &Log,
        group_id: Option<&str>,
    ) -> Result<EventBuilder, StorageError> {
        let content = serde_json::to_string(log)?;

        let mut tags = vec![
            tag(&["p", &log.to])?,
            tag(&["t", &log.chain_id])?,
            tag(&["d", &log.hash])?,
            tag(&["topic", &log.topic])?,
        ];
        if let Some(group_id) = group_id {
            tags.push(tag(&["h", group_id])?);
        }

        Ok(EventBuilder::new(Kind::Custom(KIND_TX_LOG), content).tags(tags))
    }

    /// Builds the event recording a submitted user operation.
    pub fn user_op_event(&self, msg: &UserOpMessage) -> Result<EventBuilder, StorageError> {
        let content = serde_json::to_string(&msg.userop)?;

        let tags = vec![
            tag(&["p", &msg.paymaster.to_string()])?,
            tag(&["t", &msg.chain_id.to_string()])?,
            tag(&["d", &msg.identity()])?,
        ];

        Ok(EventBuilder::new(Kind::Custom(KIND_USER_OP), content).tags(tags))
    }

    /// Builds the kind-1 note quoting a log event with its human-readable
    /// description. Tagged so the legacy log lookup finds it as a mention.
    pub fn quote_repost_event(
        &self,
        description: &str,
        alias: &str,
        target: &NostrEvent,
    ) -> Result<EventBuilder, StorageError> {
        let id = target.id.to_hex();

        let mut tags = vec![
            tag(&["e", &id, &self.relay_url, "mention"])?,
            tag(&["q", &id])?,
            tag(&["t", "mention"])?,
        ];
        if !alias.is_empty() {
            tags.push(tag(&["t", alias])?);
        }

        Ok(EventBuilder::new(Kind::TextNote, description).tags(tags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogStatus;
    use alloy::primitives::U256;
    use chrono::Utc;

    fn service() -> NostrService {
        NostrService::new(
            Keys::generate(),
            RelayStorage::in_memory("secret"),
            "wss://relay.example.com",
        )
    }

    fn sample_log() -> Log {
        Log {
            hash: "0xabc".into(),
            tx_hash: "0xdef".into(),
            chain_id: "1".into(),
            topic: "0xddf252ad".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            nonce: 0,
            sender: String::new(),
            to: "0xcontract".into(),
            value: U256::ZERO,
            data: Some(serde_json::json!({"topic": "0xddf252ad"})),
            extra_data: None,
            status: LogStatus::Success,
        }
    }

    #[tokio::test]
    async fn saves_signed_log_events() {
        let svc = service();
        let builder = svc.tx_log_event(&sample_log(), Some("group")).unwrap();
        let event = svc.sign_and_save(builder).await.unwrap();

        assert!(event.verify().is_ok());
        assert_eq!(event.kind, Kind::Custom(KIND_TX_LOG));
        assert_eq!(tag_value(&event, "d"), Some("0xabc"));
        assert_eq!(tag_value(&event, "h"), Some("group"));
        assert_eq!(tag_value(&event, "topic"), Some("0xddf252ad"));
    }

    #[tokio::test]
    async fn duplicate_saves_are_idempotent() {
        let svc = service();
        let event =
            svc.sign_and_save(svc.tx_log_event(&sample_log(), None).unwrap()).await.unwrap();
        // Saving the same id again must not error.
        svc.storage.save_event(&event).await.unwrap();
    }

    #[tokio::test]
    async fn quote_reposts_are_found_as_mentions() {
        let svc = service();
        let log_event =
            svc.sign_and_save(svc.tx_log_event(&sample_log(), None).unwrap()).await.unwrap();

        let repost = svc.quote_repost_event("lunch money", "transfers", &log_event).unwrap();
        svc.sign_and_save(repost).await.unwrap();

        let found = svc
            .storage
            .get_mention_event(&log_event.id.to_hex())
            .await
            .unwrap()
            .expect("mention should be stored");
        assert_eq!(found.content, "lunch money");
    }
}
