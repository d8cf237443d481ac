//! Nostr relay endpoint.
//!
//! Speaks the standard `EVENT`/`REQ`/`CLOSE`/`COUNT` frames over a
//! WebSocket, verifies signatures, runs every incoming event through the
//! group enforcer and serves stored events back out of the event store.
//! Live subscriptions receive events stored after their `REQ`.

use super::groups::GroupsService;
use crate::{error::RelayError, storage::RelayStorage, version::RELAY_VERSION};
use axum::extract::ws::{Message as WsFrame, WebSocket};
use futures_util::{SinkExt, StreamExt};
use nostr::{Event as NostrEvent, Filter};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast;
use tracing::debug;

/// NIP-11 relay information, filled from the environment.
#[derive(Debug, Clone, Default)]
pub struct RelayInfo {
    /// Relay display name.
    pub name: String,
    /// Relay description.
    pub description: String,
    /// Icon URL.
    pub icon: String,
}

/// Per-connection subscription state.
type Subscriptions = HashMap<String, Vec<Filter>>;

/// The relay endpoint shared across connections.
#[derive(Debug)]
pub struct NostrRelay {
    storage: RelayStorage,
    groups: GroupsService,
    info: RelayInfo,
    pubkey: String,
    live: broadcast::Sender<NostrEvent>,
}

impl NostrRelay {
    /// Creates the relay endpoint.
    pub fn new(
        storage: RelayStorage,
        groups: GroupsService,
        info: RelayInfo,
        pubkey: String,
    ) -> Arc<Self> {
        let (live, _) = broadcast::channel(256);
        Arc::new(Self { storage, groups, info, pubkey, live })
    }

    /// Verifies, validates and stores an incoming event, then feeds it to
    /// live subscribers. Returns the reason when the event is refused.
    pub async fn ingest(&self, event: NostrEvent) -> Result<(), RelayError> {
        event
            .verify()
            .map_err(|_| RelayError::validation("invalid: bad signature"))?;

        self.groups.validate_event(&event).await?;

        self.storage.save_event(&event).await?;
        self.groups.on_event_saved(&event).await;

        let _ = self.live.send(event);
        Ok(())
    }

    /// The NIP-11 information document.
    pub fn info_document(&self) -> Value {
        json!({
            "name": self.info.name,
            "description": self.info.description,
            "icon": self.info.icon,
            "pubkey": self.pubkey,
            "supported_nips": [1, 11, 29],
            "software": "oprelay",
            "version": RELAY_VERSION,
        })
    }

    /// Handles one client frame, returning the frames to send back.
    pub async fn handle_frame(&self, text: &str, subs: &mut Subscriptions) -> Vec<String> {
        let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
            return vec![notice("could not parse message")];
        };

        match frame.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let Some(raw) = frame.get(1) else {
                    return vec![notice("EVENT frame is missing the event")];
                };
                let event: NostrEvent = match serde_json::from_value(raw.clone()) {
                    Ok(event) => event,
                    Err(_) => return vec![notice("could not parse event")],
                };

                let id = event.id.to_hex();
                match self.ingest(event).await {
                    Ok(()) => vec![ok_frame(&id, true, "")],
                    Err(err) => vec![ok_frame(&id, false, &err.to_string())],
                }
            }
            Some("REQ") => {
                let Some(sub_id) = frame.get(1).and_then(Value::as_str) else {
                    return vec![notice("REQ frame is missing a subscription id")];
                };

                let mut filters = Vec::new();
                for raw in frame.iter().skip(2) {
                    match serde_json::from_value::<Filter>(raw.clone()) {
                        Ok(filter) => filters.push(filter),
                        Err(_) => {
                            return vec![closed_frame(sub_id, "invalid: bad filter")];
                        }
                    }
                }

                let mut out = Vec::new();
                for filter in &filters {
                    match self.storage.query_events(filter.clone()).await {
                        Ok(events) => {
                            for event in events {
                                out.push(event_frame(sub_id, &event));
                            }
                        }
                        Err(err) => {
                            debug!(%err, "query failed");
                            return vec![closed_frame(sub_id, "error: query failed")];
                        }
                    }
                }
                out.push(json!(["EOSE", sub_id]).to_string());

                subs.insert(sub_id.to_string(), filters);
                out
            }
            Some("CLOSE") => {
                if let Some(sub_id) = frame.get(1).and_then(Value::as_str) {
                    subs.remove(sub_id);
                    vec![closed_frame(sub_id, "")]
                } else {
                    vec![notice("CLOSE frame is missing a subscription id")]
                }
            }
            Some("COUNT") => {
                let Some(sub_id) = frame.get(1).and_then(Value::as_str) else {
                    return vec![notice("COUNT frame is missing a subscription id")];
                };

                let mut count = 0usize;
                for raw in frame.iter().skip(2) {
                    if let Ok(filter) = serde_json::from_value::<Filter>(raw.clone()) {
                        count += self.storage.count_events(filter).await.unwrap_or(0);
                    }
                }
                vec![json!(["COUNT", sub_id, {"count": count}]).to_string()]
            }
            _ => vec![notice("unknown message type")],
        }
    }

    /// Frames produced for a freshly stored event against this
    /// connection's subscriptions.
    pub fn live_frames(subs: &Subscriptions, event: &NostrEvent) -> Vec<String> {
        subs.iter()
            .filter(|(_, filters)| filters.iter().any(|f| f.match_event(event)))
            .map(|(sub_id, _)| event_frame(sub_id, event))
            .collect()
    }

    /// Drives one relay WebSocket connection to completion.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let mut live_rx = self.live.subscribe();
        let mut subs = Subscriptions::new();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(WsFrame::Text(text))) => text,
                        Some(Ok(WsFrame::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(_)) => break,
                    };

                    for reply in self.handle_frame(&text, &mut subs).await {
                        if sink.send(WsFrame::Text(reply.into())).await.is_err() {
                            return;
                        }
                    }
                }
                event = live_rx.recv() => {
                    let Ok(event) = event else { continue };
                    for reply in Self::live_frames(&subs, &event) {
                        if sink.send(WsFrame::Text(reply.into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn notice(message: &str) -> String {
    json!(["NOTICE", message]).to_string()
}

fn ok_frame(event_id: &str, accepted: bool, message: &str) -> String {
    json!(["OK", event_id, accepted, message]).to_string()
}

fn closed_frame(sub_id: &str, message: &str) -> String {
    json!(["CLOSED", sub_id, message]).to_string()
}

fn event_frame(sub_id: &str, event: &NostrEvent) -> String {
    json!(["EVENT", sub_id, event]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::NostrService;
    use nostr::{EventBuilder, Keys, Kind};

    fn relay() -> Arc<NostrRelay> {
        let storage = RelayStorage::in_memory("secret");
        let nostr =
            NostrService::new(Keys::generate(), storage.clone(), "wss://relay.example.com");
        let pubkey = nostr.public_key_hex();
        let groups = GroupsService::new(storage.clone(), nostr);
        NostrRelay::new(
            storage,
            groups,
            RelayInfo {
                name: "test relay".into(),
                description: "test".into(),
                icon: String::new(),
            },
            pubkey,
        )
    }

    fn signed_note(keys: &Keys, content: &str) -> NostrEvent {
        EventBuilder::new(Kind::TextNote, content).sign_with_keys(keys).unwrap()
    }

    #[tokio::test]
    async fn accepts_and_serves_events() {
        let relay = relay();
        let keys = Keys::generate();
        let note = signed_note(&keys, "hello");
        let mut subs = Subscriptions::new();

        let frame = json!(["EVENT", note]).to_string();
        let replies = relay.handle_frame(&frame, &mut subs).await;
        assert_eq!(replies.len(), 1);
        let ok: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(ok[0], "OK");
        assert_eq!(ok[2], true);

        // REQ returns the stored event, then EOSE.
        let req = json!(["REQ", "s1", {"kinds": [1]}]).to_string();
        let replies = relay.handle_frame(&req, &mut subs).await;
        assert_eq!(replies.len(), 2);
        let event_reply: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(event_reply[0], "EVENT");
        assert_eq!(event_reply[1], "s1");
        assert_eq!(event_reply[2]["content"], "hello");
        let eose: Value = serde_json::from_str(&replies[1]).unwrap();
        assert_eq!(eose[0], "EOSE");

        assert!(subs.contains_key("s1"));
    }

    #[tokio::test]
    async fn rejects_tampered_events() {
        let relay = relay();
        let keys = Keys::generate();
        let mut note = serde_json::to_value(signed_note(&keys, "hello")).unwrap();
        note["content"] = json!("tampered");

        let frame = json!(["EVENT", note]).to_string();
        let mut subs = Subscriptions::new();
        let replies = relay.handle_frame(&frame, &mut subs).await;

        let ok: Value = serde_json::from_str(&replies[0]).unwrap();
        // Either the event no longer parses or it fails verification;
        // both must refuse it.
        assert!(ok[0] == "NOTICE" || ok[2] == false);
    }

    #[tokio::test]
    async fn enforces_group_membership_on_ingest() {
        let relay = relay();
        let outsider = Keys::generate();

        let event = EventBuilder::new(Kind::Custom(9), "hi")
            .tags([nostr::Tag::parse(["h", "private-group"]).unwrap()])
            .sign_with_keys(&outsider)
            .unwrap();

        let frame = json!(["EVENT", event]).to_string();
        let mut subs = Subscriptions::new();
        let replies = relay.handle_frame(&frame, &mut subs).await;

        let ok: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(ok[2], false);
        assert!(ok[3].as_str().unwrap().contains("members"));
    }

    #[tokio::test]
    async fn counts_events() {
        let relay = relay();
        let keys = Keys::generate();
        let mut subs = Subscriptions::new();

        for i in 0..3 {
            let frame =
                json!(["EVENT", signed_note(&keys, &format!("note {i}"))]).to_string();
            relay.handle_frame(&frame, &mut subs).await;
        }

        let count = json!(["COUNT", "c1", {"kinds": [1]}]).to_string();
        let replies = relay.handle_frame(&count, &mut subs).await;
        let reply: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(reply[2]["count"], 3);
    }

    #[tokio::test]
    async fn live_frames_respect_filters() {
        let keys = Keys::generate();
        let note = signed_note(&keys, "fresh");

        let mut subs = Subscriptions::new();
        subs.insert("match".into(), vec![Filter::new().kind(Kind::TextNote)]);
        subs.insert("miss".into(), vec![Filter::new().kind(Kind::Custom(9))]);

        let frames = NostrRelay::live_frames(&subs, &note);
        assert_eq!(frames.len(), 1);
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame[1], "match");
    }

    #[tokio::test]
    async fn close_removes_subscription() {
        let relay = relay();
        let mut subs = Subscriptions::new();
        subs.insert("s1".into(), vec![Filter::new()]);

        let replies = relay.handle_frame(&json!(["CLOSE", "s1"]).to_string(), &mut subs).await;
        assert!(subs.is_empty());
        let closed: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(closed[0], "CLOSED");
    }
}
