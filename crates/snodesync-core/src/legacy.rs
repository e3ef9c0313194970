use crate::config::SyncMode;
use crate::error::CoreError;
use crate::event::BackgroundTasks;
use crate::group_crypto::HexKeyPair;
use crate::groups::{ClosedGroups, GroupDesiredState};
use crate::ids::{community_conversation_id, parse_open_group_url};
use crate::profile::ProfileManager;
use crate::reconcile::CommunityJoiner;
use crate::store::{
    get_last_profile_update_timestamp, ConversationKind, ConversationStore, ItemStore,
    ProfilePicture, StoredItem, TimelineEntry, TimelineKind, HAS_SYNCED_INITIAL_CONFIGURATION_ITEM,
};
use crate::swarm::SubscriptionRegistry;
use crate::wrapper::CommunityEntry;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyClosedGroup {
    pub public_key: String,
    pub name: String,
    pub members: Vec<String>,
    pub admins: Vec<String>,
    pub encryption_key_pair: Option<HexKeyPair>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyContact {
    pub public_key: String,
    pub name: Option<String>,
    pub profile_picture: Option<String>,
    pub profile_key: Option<Vec<u8>>,
    pub is_approved: Option<bool>,
    pub is_blocked: Option<bool>,
    pub did_approve_me: Option<bool>,
}

/// Single-shot snapshot of the account sent by one of our own devices.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyConfigurationMessage {
    pub display_name: String,
    pub profile_picture: Option<String>,
    pub profile_key: Option<Vec<u8>>,
    pub closed_groups: Vec<LegacyClosedGroup>,
    pub open_groups: Vec<String>,
    pub contacts: Vec<LegacyContact>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyEnvelope {
    pub source: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LegacyOutcome {
    /// The shared config path owns this account now.
    Disabled,
    /// Sent by someone other than us.
    Dropped,
    Applied {
        profile_applied: bool,
        groups_and_contacts_applied: bool,
    },
}

#[derive(Clone)]
pub struct LegacyConfigHandler {
    our_key: String,
    sync_mode: SyncMode,
    registration_done: Arc<AtomicBool>,
    items: Arc<dyn ItemStore>,
    conversations: Arc<dyn ConversationStore>,
    profiles: ProfileManager,
    groups: ClosedGroups,
    subscriptions: SubscriptionRegistry,
    joiner: Arc<dyn CommunityJoiner>,
    tasks: BackgroundTasks,
}

impl LegacyConfigHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        our_key: String,
        sync_mode: SyncMode,
        registration_done: Arc<AtomicBool>,
        items: Arc<dyn ItemStore>,
        conversations: Arc<dyn ConversationStore>,
        profiles: ProfileManager,
        groups: ClosedGroups,
        subscriptions: SubscriptionRegistry,
        joiner: Arc<dyn CommunityJoiner>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            our_key,
            sync_mode,
            registration_done,
            items,
            conversations,
            profiles,
            groups,
            subscriptions,
            joiner,
            tasks,
        }
    }

    pub fn enabled(&self) -> bool {
        self.sync_mode
            .legacy_enabled(self.registration_done.load(Ordering::SeqCst))
    }

    pub async fn handle_configuration_message(
        &self,
        envelope: &LegacyEnvelope,
        message: &LegacyConfigurationMessage,
    ) -> Result<LegacyOutcome, CoreError> {
        if !self.enabled() {
            log::info!("shared config is in charge, not handling legacy configuration message");
            return Ok(LegacyOutcome::Disabled);
        }
        if envelope.source != self.our_key {
            log::info!("dropping configuration change from someone else than us");
            return Ok(LegacyOutcome::Dropped);
        }
        let profile_applied = self.handle_our_profile_update(envelope.timestamp, message).await?;
        let groups_and_contacts_applied = self
            .handle_groups_and_contacts(envelope, message)
            .await?;
        Ok(LegacyOutcome::Applied {
            profile_applied,
            groups_and_contacts_applied,
        })
    }

    async fn handle_our_profile_update(
        &self,
        sent_at: u64,
        message: &LegacyConfigurationMessage,
    ) -> Result<bool, CoreError> {
        let last = get_last_profile_update_timestamp(self.items.as_ref()).await?;
        if matches!(last, Some(last) if sent_at <= last) {
            return Ok(false);
        }
        log::info!(
            "handling our legacy profile update, last update:{:?} sent at:{}",
            last,
            sent_at
        );
        let picture = ProfilePicture::usable(
            message.profile_picture.as_deref(),
            message.profile_key.as_deref(),
        );
        self.profiles
            .apply_our_profile(sent_at, &message.display_name, picture)
            .await
    }

    async fn handle_groups_and_contacts(
        &self,
        envelope: &LegacyEnvelope,
        message: &LegacyConfigurationMessage,
    ) -> Result<bool, CoreError> {
        let last_config_timestamp = self
            .items
            .get_item(HAS_SYNCED_INITIAL_CONFIGURATION_ITEM)
            .await?
            .and_then(|item| item.timestamp);
        if matches!(last_config_timestamp, Some(last) if last >= envelope.timestamp) {
            log::info!("received outdated configuration message, dropping it");
            return Ok(false);
        }
        self.items
            .set_item(StoredItem {
                id: HAS_SYNCED_INITIAL_CONFIGURATION_ITEM.to_string(),
                value: serde_json::Value::Bool(true),
                timestamp: Some(envelope.timestamp),
            })
            .await?;

        if last_config_timestamp.is_none() {
            self.handle_closed_groups(&message.closed_groups, envelope.timestamp)
                .await;
        }
        self.handle_open_groups(&message.open_groups).await;

        let contacts = message
            .contacts
            .iter()
            .map(|contact| self.handle_contact(contact, envelope.timestamp));
        for (contact, result) in message.contacts.iter().zip(join_all(contacts).await) {
            if let Err(e) = result {
                log::warn!("legacy contact {} not applied: {}", contact.public_key, e);
            }
        }
        Ok(true)
    }

    async fn handle_closed_groups(&self, closed_groups: &[LegacyClosedGroup], timestamp: u64) {
        log::info!(
            "received {} closed groups in configuration, creating them",
            closed_groups.len()
        );
        let creations = closed_groups
            .iter()
            .map(|group| self.create_closed_group(group, timestamp));
        for (group, result) in closed_groups.iter().zip(join_all(creations).await) {
            if let Err(e) = result {
                log::warn!("closed group {} from configuration failed: {}", group.public_key, e);
            }
        }
    }

    async fn create_closed_group(
        &self,
        group: &LegacyClosedGroup,
        timestamp: u64,
    ) -> Result<(), CoreError> {
        if group.public_key.is_empty() {
            return Err(CoreError::Validation("group_public_key".to_string()));
        }
        let details = GroupDesiredState {
            id: group.public_key.clone(),
            name: group.name.clone(),
            members: group.members.clone(),
            admins: group.admins.clone(),
            zombies: Vec::new(),
            active_at: timestamp,
            expire_timer: None,
            blocked: false,
            we_were_just_added: true,
        };
        self.groups.update_or_create_closed_group(&details).await?;
        if let Some(pair) = group.encryption_key_pair.clone() {
            self.groups
                .keyring()
                .add_if_needed(&group.public_key, pair)
                .await?;
        }
        self.subscriptions.add_pubkey(&group.public_key).await;
        Ok(())
    }

    async fn handle_open_groups(&self, open_groups: &[String]) {
        for url in open_groups {
            let Some(room) = parse_open_group_url(url) else {
                continue;
            };
            let id = match community_conversation_id(&room.server_url, &room.room_id) {
                Ok(id) => id,
                Err(_) => continue,
            };
            match self.conversations.get(&id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    log::warn!("looking up community {} failed: {}", id, e);
                    continue;
                }
            }
            log::info!("triggering join of community {} from configuration message", url);
            let joiner = self.joiner.clone();
            let entry = CommunityEntry {
                base_url: room.server_url,
                room_case_preserved: room.room_id,
                pubkey_hex: room.server_public_key,
                priority: 0,
            };
            self.tasks
                .spawn(format!("join:{}", id), async move { joiner.join(entry).await })
                .await;
        }
    }

    async fn handle_contact(&self, contact: &LegacyContact, timestamp: u64) -> Result<(), CoreError> {
        if contact.public_key.is_empty() {
            return Ok(());
        }
        let mut convo = self
            .conversations
            .get_or_create(&contact.public_key, ConversationKind::Private)
            .await?;
        if convo.active_at == 0 {
            convo.active_at = timestamp;
        }

        if contact.is_approved == Some(true) {
            if !convo.approved {
                convo.approved = true;
                self.conversations.commit(&convo).await?;
                self.conversations
                    .add_message(
                        &convo.id,
                        TimelineEntry {
                            id: Uuid::new_v4().to_string(),
                            sent_at: timestamp,
                            sender: self.our_key.clone(),
                            outgoing: true,
                            read: true,
                            kind: TimelineKind::OutgoingApproval,
                        },
                    )
                    .await?;
            }
            if contact.did_approve_me == Some(true) {
                convo.approved_me = true;
            }
        }

        match contact.is_blocked {
            Some(true) => {
                if convo.is_incoming_request() {
                    self.conversations.delete_messages(&convo.id).await?;
                    convo.unread_count = 0;
                }
                convo.blocked = true;
            }
            Some(false) => convo.blocked = false,
            None => {}
        }
        self.conversations.commit(&convo).await?;

        let picture = ProfilePicture::usable(
            contact.profile_picture.as_deref(),
            contact.profile_key.as_deref(),
        );
        self.profiles
            .update_profile_of_contact(&convo.id, contact.name.clone(), picture)
            .await
    }
}
