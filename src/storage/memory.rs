//! Relay storage implementation in-memory. For testing only.

use super::{api::Result, crypt, StorageApi};
use crate::{
    constants::KIND_TX_LOG,
    error::StorageError,
    nostr::{tag_value, tag_values},
    types::{Event, Sponsor},
};
use async_trait::async_trait;
use dashmap::DashMap;
use nostr::{Event as NostrEvent, Filter, Kind};

/// [`StorageApi`] implementation in-memory. Used for testing.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    secret: String,
    events: DashMap<String, NostrEvent>,
    sponsors: DashMap<String, Sponsor>,
    registry: DashMap<(String, String, String), Event>,
    pending_data: DashMap<String, serde_json::Value>,
}

impl InMemoryStorage {
    /// Creates an empty store encrypting sponsor keys with `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into(), ..Default::default() }
    }

    fn sorted(&self, mut events: Vec<NostrEvent>, limit: Option<usize>) -> Vec<NostrEvent> {
        events.sort_by(|a, b| {
            b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }
}

#[async_trait]
impl StorageApi for InMemoryStorage {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn save_event(&self, event: &NostrEvent) -> Result<()> {
        self.events.entry(event.id.to_hex()).or_insert_with(|| event.clone());
        Ok(())
    }

    async fn save_replaceable_event(&self, event: &NostrEvent) -> Result<()> {
        let d = tag_value(event, "d").unwrap_or_default().to_string();
        self.events.retain(|_, stored| {
            !(stored.kind == event.kind
                && stored.pubkey == event.pubkey
                && tag_value(stored, "d").unwrap_or_default() == d)
        });
        self.events.insert(event.id.to_hex(), event.clone());
        Ok(())
    }

    async fn query_events(&self, filter: Filter) -> Result<Vec<NostrEvent>> {
        let matched: Vec<NostrEvent> = self
            .events
            .iter()
            .filter(|entry| filter.match_event(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(self.sorted(matched, filter.limit))
    }

    async fn count_events(&self, filter: Filter) -> Result<usize> {
        Ok(self.events.iter().filter(|entry| filter.match_event(entry.value())).count())
    }

    async fn delete_event(&self, event_id: &str) -> Result<()> {
        self.events.remove(event_id);
        Ok(())
    }

    async fn get_log_event(&self, chain_id: &str, hash: &str) -> Result<Option<NostrEvent>> {
        Ok(self
            .events
            .iter()
            .find(|entry| {
                let ev = entry.value();
                ev.kind == Kind::Custom(KIND_TX_LOG)
                    && tag_values(ev, "t").any(|v| v == chain_id)
                    && tag_value(ev, "d") == Some(hash)
            })
            .map(|entry| entry.value().clone()))
    }

    async fn list_log_events(
        &self,
        contract: &str,
        topic: &str,
        max_created_at: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<NostrEvent>> {
        let matched: Vec<NostrEvent> = self
            .events
            .iter()
            .filter(|entry| {
                let ev = entry.value();
                ev.kind == Kind::Custom(KIND_TX_LOG)
                    && ev.created_at.as_u64() as i64 <= max_created_at
                    && tag_value(ev, "p") == Some(contract)
                    && tag_value(ev, "topic") == Some(topic)
            })
            .map(|entry| entry.value().clone())
            .collect();

        let sorted = self.sorted(matched, None);
        Ok(sorted
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn get_mention_event(&self, event_id: &str) -> Result<Option<NostrEvent>> {
        Ok(self
            .events
            .iter()
            .find(|entry| {
                let ev = entry.value();
                ev.kind == Kind::TextNote
                    && tag_values(ev, "e").any(|v| v == event_id)
                    && tag_values(ev, "t").any(|v| v == "mention")
            })
            .map(|entry| entry.value().clone()))
    }

    async fn get_sponsor(&self, contract: &str) -> Result<Sponsor> {
        let mut sponsor =
            self.sponsors.get(contract).map(|s| s.clone()).ok_or(StorageError::NotFound)?;
        sponsor.private_key = crypt::decrypt(&sponsor.private_key, &self.secret)?;
        Ok(sponsor)
    }

    async fn add_sponsor(&self, sponsor: &Sponsor) -> Result<()> {
        let mut stored = sponsor.clone();
        stored.private_key = crypt::encrypt(&sponsor.private_key, &self.secret)?;
        self.sponsors.insert(stored.contract.clone(), stored);
        Ok(())
    }

    async fn update_sponsor(&self, sponsor: &Sponsor) -> Result<()> {
        self.add_sponsor(sponsor).await
    }

    async fn register_event(&self, event: &Event) -> Result<()> {
        let key =
            (event.chain_id.clone(), event.contract.clone(), event.topic.clone());
        self.registry.insert(key, event.clone());
        Ok(())
    }

    async fn event_exists(&self, chain_id: &str, contract: &str) -> Result<bool> {
        Ok(self
            .registry
            .iter()
            .any(|entry| entry.key().0 == chain_id && entry.key().1 == contract))
    }

    async fn get_event(&self, chain_id: &str, contract: &str, topic: &str) -> Result<Event> {
        self.registry
            .get(&(chain_id.to_string(), contract.to_string(), topic.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::NotFound)
    }

    async fn list_events(&self, chain_id: &str) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .registry
            .iter()
            .filter(|entry| entry.key().0 == chain_id)
            .map(|entry| entry.value().clone())
            .collect();
        events.sort_by_key(|ev| ev.created_at);
        Ok(events)
    }

    async fn upsert_pending_data(&self, hash: &str, data: &serde_json::Value) -> Result<()> {
        self.pending_data.insert(hash.to_string(), data.clone());
        Ok(())
    }

    async fn get_pending_data(&self, hash: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.pending_data.get(hash).map(|entry| entry.value().clone()))
    }

    async fn delete_pending_data(&self, hash: &str) -> Result<()> {
        self.pending_data.remove(hash);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
