//! NIP-29 closed-group enforcement.
//!
//! Groups are closed: the creator is admin, only admins admit members, and
//! only current members may post content. Membership is materialized into
//! relay-authored 39000/39001/39002 events after every moderation change;
//! admission checks prefer those lists and fall back to replaying the
//! moderation log when they have not been generated yet.

use super::{p_tags, tag_value, NostrService};
use crate::{error::RelayError, storage::RelayStorage};
use nostr::{Alphabet, Event as NostrEvent, EventBuilder, Filter, Kind, SingleLetterTag, Tag};
use tracing::{debug, warn};

/// Add user to group / assign role.
pub const KIND_PUT_USER: u16 = 9000;
/// Remove user from group.
pub const KIND_REMOVE_USER: u16 = 9001;
/// Edit group metadata.
pub const KIND_EDIT_METADATA: u16 = 9002;
/// Delete an event from a group.
pub const KIND_DELETE_EVENT: u16 = 9005;
/// Create a new group.
pub const KIND_CREATE_GROUP: u16 = 9007;
/// Delete a group.
pub const KIND_DELETE_GROUP: u16 = 9008;
/// Request to join a group.
pub const KIND_JOIN_REQUEST: u16 = 9021;
/// Request to leave a group.
pub const KIND_LEAVE_REQUEST: u16 = 9022;
/// Relay-generated group metadata.
pub const KIND_GROUP_METADATA: u16 = 39000;
/// Relay-generated admins list.
pub const KIND_GROUP_ADMINS: u16 = 39001;
/// Relay-generated members list.
pub const KIND_GROUP_MEMBERS: u16 = 39002;

/// Group content kinds that always require membership.
pub const GROUP_CONTENT_KINDS: [u16; 4] = [9, 10, 11, 12];

const ROLE_ADMIN: &str = "admin";
const ROLE_MEMBER: &str = "member";

fn reject(reason: &str) -> RelayError {
    RelayError::validation(reason)
}

/// Validates and materializes NIP-29 group state.
#[derive(Debug, Clone)]
pub struct GroupsService {
    storage: RelayStorage,
    nostr: NostrService,
}

impl GroupsService {
    /// Creates the enforcer.
    pub fn new(storage: RelayStorage, nostr: NostrService) -> Self {
        Self { storage, nostr }
    }

    /// Admission rule for an incoming event. An error means the relay must
    /// refuse to store it, with the reason reported to the client.
    pub async fn validate_event(&self, event: &NostrEvent) -> Result<(), RelayError> {
        match event.kind.as_u16() {
            KIND_CREATE_GROUP => self.validate_create_group(event).await,
            KIND_PUT_USER => self.validate_put_user(event).await,
            KIND_REMOVE_USER => self.validate_remove_user(event).await,
            KIND_EDIT_METADATA => self.validate_admin_action(event, "only admins can edit group metadata").await,
            KIND_DELETE_EVENT => self.validate_admin_action(event, "only admins can delete events").await,
            KIND_DELETE_GROUP => self.validate_admin_action(event, "only admins can delete the group").await,
            KIND_JOIN_REQUEST => self.validate_join_request(event).await,
            KIND_LEAVE_REQUEST => self.validate_leave_request(event).await,
            kind if GROUP_CONTENT_KINDS.contains(&kind) => {
                self.validate_group_content(event).await
            }
            // Any other event targeting a group is group content too.
            _ if tag_value(event, "h").is_some() => self.validate_group_content(event).await,
            _ => Ok(()),
        }
    }

    async fn validate_create_group(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let group_id = tag_value(event, "h")
            .ok_or_else(|| reject("missing h tag (group ID) for group creation"))?;

        if self.group_exists(group_id).await? {
            return Err(reject("group already exists"));
        }

        Ok(())
    }

    async fn validate_put_user(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let group_id = tag_value(event, "h").ok_or_else(|| reject("missing h tag (group ID)"))?;

        if !self.is_admin(&event.pubkey.to_hex(), group_id).await? {
            return Err(reject("only admins can add users or change roles"));
        }

        let targets = p_tags(event);
        if targets.is_empty() {
            return Err(reject("missing p tag (target user pubkey)"));
        }

        for (target, role) in &targets {
            if role.as_deref() == Some(ROLE_ADMIN)
                && !self.is_member(target, group_id).await?
            {
                return Err(RelayError::Validation(format!(
                    "user {} must be a member before being promoted to admin",
                    &target[..8.min(target.len())]
                )));
            }
        }

        Ok(())
    }

    async fn validate_remove_user(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let group_id = tag_value(event, "h").ok_or_else(|| reject("missing h tag (group ID)"))?;

        if !self.is_admin(&event.pubkey.to_hex(), group_id).await? {
            return Err(reject("only admins can remove users"));
        }

        if p_tags(event).is_empty() {
            return Err(reject("missing p tag (target user pubkey)"));
        }

        Ok(())
    }

    async fn validate_admin_action(
        &self,
        event: &NostrEvent,
        reason: &str,
    ) -> Result<(), RelayError> {
        let group_id = tag_value(event, "h").ok_or_else(|| reject("missing h tag (group ID)"))?;

        if !self.is_admin(&event.pubkey.to_hex(), group_id).await? {
            return Err(reject(reason));
        }

        Ok(())
    }

    /// Join requests are stored so admins can act on them, but grant
    /// nothing by themselves.
    async fn validate_join_request(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let group_id = tag_value(event, "h").ok_or_else(|| reject("missing h tag (group ID)"))?;

        if !self.group_exists(group_id).await? {
            return Err(reject("group does not exist"));
        }

        Ok(())
    }

    async fn validate_leave_request(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let group_id = tag_value(event, "h").ok_or_else(|| reject("missing h tag (group ID)"))?;

        if !self.is_member(&event.pubkey.to_hex(), group_id).await? {
            return Err(reject("you are not a member of this group"));
        }

        Ok(())
    }

    async fn validate_group_content(&self, event: &NostrEvent) -> Result<(), RelayError> {
        // Content without an h tag is not group content.
        let Some(group_id) = tag_value(event, "h") else {
            return Ok(());
        };

        if !self.is_member(&event.pubkey.to_hex(), group_id).await? {
            return Err(reject("only group members can post content"));
        }

        Ok(())
    }

    /// Regenerates the relay-authored group state after a stored
    /// moderation event.
    pub async fn on_event_saved(&self, event: &NostrEvent) {
        let result = match event.kind.as_u16() {
            KIND_CREATE_GROUP => self.handle_group_created(event).await,
            KIND_PUT_USER => self.handle_user_added(event).await,
            KIND_REMOVE_USER => self.handle_user_removed(event).await,
            KIND_EDIT_METADATA => self.handle_metadata_edited(event).await,
            KIND_LEAVE_REQUEST => self.handle_user_left(event).await,
            _ => Ok(()),
        };

        if let Err(err) = result {
            warn!(%err, kind = event.kind.as_u16(), "failed to materialize group state");
        }
    }

    async fn handle_group_created(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let Some(group_id) = tag_value(event, "h") else {
            return Ok(());
        };

        debug!(group = group_id, creator = %event.pubkey, "group created");

        self.generate_metadata(group_id, event).await?;
        self.generate_admins_list(group_id, vec![event.pubkey.to_hex()]).await?;
        // The creator is admin, not a plain member.
        self.generate_members_list(group_id, vec![]).await?;
        Ok(())
    }

    async fn handle_user_added(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let Some(group_id) = tag_value(event, "h") else {
            return Ok(());
        };

        for (target, role) in p_tags(event) {
            let role = role.unwrap_or_else(|| ROLE_MEMBER.to_string());

            if role == ROLE_ADMIN {
                let mut admins = self.get_admins(group_id).await?;
                if !admins.contains(&target) {
                    admins.push(target.clone());
                }
                self.generate_admins_list(group_id, admins).await?;
            }

            let mut members = self.get_members(group_id).await?;
            if !members.contains(&target) {
                members.push(target);
            }
            self.generate_members_list(group_id, members).await?;
        }

        Ok(())
    }

    async fn handle_user_removed(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let Some(group_id) = tag_value(event, "h") else {
            return Ok(());
        };

        for (target, _) in p_tags(event) {
            self.remove_everywhere(group_id, &target).await?;
        }

        Ok(())
    }

    async fn handle_user_left(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let Some(group_id) = tag_value(event, "h") else {
            return Ok(());
        };

        self.remove_everywhere(group_id, &event.pubkey.to_hex()).await
    }

    async fn remove_everywhere(&self, group_id: &str, pubkey: &str) -> Result<(), RelayError> {
        let mut admins = self.get_admins(group_id).await?;
        admins.retain(|p| p != pubkey);
        self.generate_admins_list(group_id, admins).await?;

        let mut members = self.get_members(group_id).await?;
        members.retain(|p| p != pubkey);
        self.generate_members_list(group_id, members).await?;
        Ok(())
    }

    async fn handle_metadata_edited(&self, event: &NostrEvent) -> Result<(), RelayError> {
        let Some(group_id) = tag_value(event, "h") else {
            return Ok(());
        };

        self.generate_metadata(group_id, event).await
    }

    async fn generate_metadata(
        &self,
        group_id: &str,
        source: &NostrEvent,
    ) -> Result<(), RelayError> {
        let mut tags = vec![
            parse_tag(&["d", group_id])?,
            parse_tag(&["closed"])?,
            parse_tag(&["private"])?,
        ];
        for name in ["name", "about", "picture"] {
            if let Some(value) = tag_value(source, name) {
                tags.push(parse_tag(&[name, value])?);
            }
        }

        let builder = EventBuilder::new(Kind::Custom(KIND_GROUP_METADATA), "").tags(tags);
        self.nostr.sign_and_save_replaceable(builder).await?;
        Ok(())
    }

    async fn generate_admins_list(
        &self,
        group_id: &str,
        admins: Vec<String>,
    ) -> Result<(), RelayError> {
        let mut tags = vec![parse_tag(&["d", group_id])?];
        for admin in &admins {
            tags.push(parse_tag(&["p", admin, ROLE_ADMIN])?);
        }

        let builder = EventBuilder::new(Kind::Custom(KIND_GROUP_ADMINS), "").tags(tags);
        self.nostr.sign_and_save_replaceable(builder).await?;
        Ok(())
    }

    async fn generate_members_list(
        &self,
        group_id: &str,
        members: Vec<String>,
    ) -> Result<(), RelayError> {
        let mut tags = vec![parse_tag(&["d", group_id])?];
        for member in &members {
            tags.push(parse_tag(&["p", member, ROLE_MEMBER])?);
        }

        let builder = EventBuilder::new(Kind::Custom(KIND_GROUP_MEMBERS), "").tags(tags);
        self.nostr.sign_and_save_replaceable(builder).await?;
        Ok(())
    }

    /// Whether `pubkey` currently administers `group_id`.
    pub async fn is_admin(&self, pubkey: &str, group_id: &str) -> Result<bool, RelayError> {
        if let Some(list) = self.relay_list(KIND_GROUP_ADMINS, group_id).await? {
            return Ok(list_contains(&list, pubkey));
        }

        self.is_admin_from_mod_events(pubkey, group_id).await
    }

    /// Whether `pubkey` is currently a member of `group_id` (admins are
    /// members too).
    pub async fn is_member(&self, pubkey: &str, group_id: &str) -> Result<bool, RelayError> {
        if self.is_admin(pubkey, group_id).await? {
            return Ok(true);
        }

        if let Some(list) = self.relay_list(KIND_GROUP_MEMBERS, group_id).await? {
            if list_contains(&list, pubkey) {
                return Ok(true);
            }
        }

        self.is_member_from_mod_events(pubkey, group_id).await
    }

    /// The latest relay-authored list event of `kind` for the group.
    async fn relay_list(
        &self,
        kind: u16,
        group_id: &str,
    ) -> Result<Option<NostrEvent>, RelayError> {
        let filter = Filter::new()
            .kind(Kind::Custom(kind))
            .author(self.nostr.public_key())
            .custom_tag(SingleLetterTag::lowercase(Alphabet::D), [group_id])
            .limit(1);

        Ok(self.storage.query_events(filter).await?.into_iter().next())
    }

    /// Replays the moderation log when the materialized lists are missing.
    async fn is_admin_from_mod_events(
        &self,
        pubkey: &str,
        group_id: &str,
    ) -> Result<bool, RelayError> {
        let author = nostr::PublicKey::from_hex(pubkey)
            .map_err(|_| RelayError::validation("invalid pubkey"))?;

        // The creator is admin unless a later removal says otherwise.
        let create = Filter::new()
            .kind(Kind::Custom(KIND_CREATE_GROUP))
            .author(author)
            .custom_tag(SingleLetterTag::lowercase(Alphabet::H), [group_id])
            .limit(1);
        if let Some(created) = self.storage.query_events(create).await?.into_iter().next() {
            return self.not_removed_since(pubkey, group_id, created.created_at).await;
        }

        let puts = Filter::new()
            .kind(Kind::Custom(KIND_PUT_USER))
            .custom_tag(SingleLetterTag::lowercase(Alphabet::H), [group_id])
            .custom_tag(SingleLetterTag::lowercase(Alphabet::P), [pubkey])
            .limit(100);
        let latest_put = self.storage.query_events(puts).await?.into_iter().next();

        if let Some(put) = latest_put {
            let promoted = p_tags(&put)
                .iter()
                .any(|(p, role)| p == pubkey && role.as_deref() == Some(ROLE_ADMIN));
            if promoted {
                return self.not_removed_since(pubkey, group_id, put.created_at).await;
            }
        }

        Ok(false)
    }

    async fn is_member_from_mod_events(
        &self,
        pubkey: &str,
        group_id: &str,
    ) -> Result<bool, RelayError> {
        let filter = Filter::new()
            .kinds([Kind::Custom(KIND_PUT_USER), Kind::Custom(KIND_REMOVE_USER)])
            .custom_tag(SingleLetterTag::lowercase(Alphabet::H), [group_id])
            .custom_tag(SingleLetterTag::lowercase(Alphabet::P), [pubkey])
            .limit(10);

        // Newest first: membership is whatever the latest moderation event
        // says.
        let latest = self.storage.query_events(filter).await?.into_iter().next();
        Ok(latest.is_some_and(|ev| ev.kind.as_u16() == KIND_PUT_USER))
    }

    async fn not_removed_since(
        &self,
        pubkey: &str,
        group_id: &str,
        since: nostr::Timestamp,
    ) -> Result<bool, RelayError> {
        let filter = Filter::new()
            .kind(Kind::Custom(KIND_REMOVE_USER))
            .custom_tag(SingleLetterTag::lowercase(Alphabet::H), [group_id])
            .custom_tag(SingleLetterTag::lowercase(Alphabet::P), [pubkey])
            .since(since)
            .limit(1);

        Ok(self.storage.query_events(filter).await?.is_empty())
    }

    /// A group exists once its metadata or creation event is on record.
    pub async fn group_exists(&self, group_id: &str) -> Result<bool, RelayError> {
        let metadata = Filter::new()
            .kind(Kind::Custom(KIND_GROUP_METADATA))
            .custom_tag(SingleLetterTag::lowercase(Alphabet::D), [group_id])
            .limit(1);
        if !self.storage.query_events(metadata).await?.is_empty() {
            return Ok(true);
        }

        let created = Filter::new()
            .kind(Kind::Custom(KIND_CREATE_GROUP))
            .custom_tag(SingleLetterTag::lowercase(Alphabet::H), [group_id])
            .limit(1);
        Ok(!self.storage.query_events(created).await?.is_empty())
    }

    async fn get_admins(&self, group_id: &str) -> Result<Vec<String>, RelayError> {
        Ok(self
            .relay_list(KIND_GROUP_ADMINS, group_id)
            .await?
            .map(|ev| p_tags(&ev).into_iter().map(|(p, _)| p).collect())
            .unwrap_or_default())
    }

    async fn get_members(&self, group_id: &str) -> Result<Vec<String>, RelayError> {
        Ok(self
            .relay_list(KIND_GROUP_MEMBERS, group_id)
            .await?
            .map(|ev| p_tags(&ev).into_iter().map(|(p, _)| p).collect())
            .unwrap_or_default())
    }
}

fn list_contains(list: &NostrEvent, pubkey: &str) -> bool {
    p_tags(list).iter().any(|(p, _)| p == pubkey)
}

fn parse_tag(parts: &[&str]) -> Result<Tag, RelayError> {
    Tag::parse(parts.iter().copied())
        .map_err(|err| RelayError::Validation(err.to_string()))
}
