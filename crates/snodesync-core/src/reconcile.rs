use crate::error::CoreError;
use crate::event::BackgroundTasks;
use crate::group_crypto::HexKeyPair;
use crate::groups::{ClosedGroups, GroupDesiredState};
use crate::merge::MergeOutcome;
use crate::profile::ProfileManager;
use crate::store::{
    Conversation, ConversationKind, ConversationStore, ItemStore, ProfilePicture, StoredItem,
};
use crate::swarm::SubscriptionRegistry;
use crate::sync::ConfigSyncScheduler;
use crate::wrapper::{
    CommunityEntry, ConfigNamespace, ConfigWrappers, ContactEntry, LegacyGroupEntry, VolatileKind,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Joins a community room. Called in the background, never awaited by
/// reconciliation.
#[async_trait]
pub trait CommunityJoiner: Send + Sync {
    async fn join(&self, community: CommunityEntry) -> Result<(), CoreError>;
}

pub fn config_dump_key(namespace: ConfigNamespace, owner_key: &str) -> String {
    format!("configDump:{}:{}", namespace.as_str(), owner_key)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reconciled: Vec<ConfigNamespace>,
    pub failed: Vec<(ConfigNamespace, CoreError)>,
    pub push_queued: bool,
}

/// Applies merged namespace state to the local mirrors.
#[derive(Clone)]
pub struct Reconciler {
    our_key: String,
    wrappers: Arc<dyn ConfigWrappers>,
    conversations: Arc<dyn ConversationStore>,
    items: Arc<dyn ItemStore>,
    profiles: ProfileManager,
    groups: ClosedGroups,
    subscriptions: SubscriptionRegistry,
    joiner: Arc<dyn CommunityJoiner>,
    scheduler: ConfigSyncScheduler,
    tasks: BackgroundTasks,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        our_key: String,
        wrappers: Arc<dyn ConfigWrappers>,
        conversations: Arc<dyn ConversationStore>,
        items: Arc<dyn ItemStore>,
        profiles: ProfileManager,
        groups: ClosedGroups,
        subscriptions: SubscriptionRegistry,
        joiner: Arc<dyn CommunityJoiner>,
        scheduler: ConfigSyncScheduler,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            our_key,
            wrappers,
            conversations,
            items,
            profiles,
            groups,
            subscriptions,
            joiner,
            scheduler,
            tasks,
        }
    }

    /// Reconciles every namespace independently, persists the ones that
    /// changed and queues at most one push job for the whole batch.
    pub async fn process_merge_results(
        &self,
        outcomes: &BTreeMap<ConfigNamespace, MergeOutcome>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut any_needs_push = false;
        for (namespace, outcome) in outcomes {
            let result = match namespace {
                ConfigNamespace::UserProfile => self.handle_user_profile(outcome).await,
                ConfigNamespace::Contacts => self.handle_contacts(outcome).await,
                ConfigNamespace::UserGroups => self.handle_user_groups(outcome).await,
                ConfigNamespace::ConvoInfoVolatile => self.handle_convo_info_volatile(outcome).await,
            };
            let result = match result {
                Ok(()) if outcome.needs_dump => self.save_dump(outcome).await,
                other => other,
            };
            match result {
                Ok(()) => report.reconciled.push(*namespace),
                Err(e) => {
                    log::warn!("reconciling {} failed: {}", namespace.as_str(), e);
                    report.failed.push((*namespace, e));
                }
            }
            any_needs_push |= outcome.needs_push;
        }
        if any_needs_push {
            report.push_queued = self.scheduler.queue_new_job_if_needed().await;
        }
        report
    }

    async fn save_dump(&self, outcome: &MergeOutcome) -> Result<(), CoreError> {
        let dump = self.wrappers.dump(outcome.namespace).await?;
        self.items
            .set_item(StoredItem {
                id: config_dump_key(outcome.namespace, &outcome.owner_key),
                value: serde_json::Value::String(hex::encode(dump)),
                timestamp: Some(outcome.latest_envelope_timestamp),
            })
            .await
    }

    /// Loads every persisted namespace dump of `owner_key` into the wrappers.
    pub async fn load_dumps(&self, owner_key: &str) -> Result<usize, CoreError> {
        let mut loaded = 0;
        for namespace in ConfigNamespace::ALL {
            let Some(item) = self.items.get_item(&config_dump_key(namespace, owner_key)).await? else {
                continue;
            };
            let encoded = item.value.as_str().ok_or(CoreError::Storage)?;
            let bytes = hex::decode(encoded).map_err(|_| CoreError::Storage)?;
            self.wrappers.load(namespace, &bytes).await?;
            loaded += 1;
        }
        Ok(loaded)
    }

    async fn handle_user_profile(&self, outcome: &MergeOutcome) -> Result<(), CoreError> {
        if !outcome.needs_dump {
            return Ok(());
        }
        let profile = self.wrappers.profile().await?;
        let picture = profile
            .picture
            .and_then(|p| ProfilePicture::usable(Some(p.url.as_str()), Some(p.key.as_slice())));
        self.profiles
            .apply_our_profile(
                outcome.latest_envelope_timestamp,
                profile.name.as_deref().unwrap_or_default(),
                picture,
            )
            .await?;
        Ok(())
    }

    async fn handle_contacts(&self, outcome: &MergeOutcome) -> Result<(), CoreError> {
        if !outcome.needs_dump {
            return Ok(());
        }
        for entry in self.wrappers.contacts().await? {
            if entry.id == self.our_key {
                continue;
            }
            if let Err(e) = self.apply_contact(&entry).await {
                log::warn!("contact {} not reconciled: {}", entry.id, e);
            }
        }
        Ok(())
    }

    async fn apply_contact(&self, entry: &ContactEntry) -> Result<(), CoreError> {
        let mut convo = self
            .conversations
            .get_or_create(&entry.id, ConversationKind::Private)
            .await
            .map_err(|e| CoreError::ReconciliationField(format!("{}: {}", entry.id, e)))?;
        let mut changes = false;

        let nickname = entry.nickname.clone().filter(|n| !n.is_empty());
        if nickname != convo.nickname {
            convo.nickname = nickname;
            changes = true;
        }
        if entry.priority != convo.priority {
            convo.priority = entry.priority;
            changes = true;
        }
        if entry.approved != convo.approved {
            convo.approved = entry.approved;
            changes = true;
        }
        if entry.approved_me != convo.approved_me {
            convo.approved_me = entry.approved_me;
            changes = true;
        }
        if entry.expiration_timer_seconds != convo.expire_timer {
            convo.expire_timer = entry.expiration_timer_seconds;
            changes = true;
        }
        if entry.blocked != convo.blocked {
            convo.blocked = entry.blocked;
            changes = true;
        }
        if changes {
            self.conversations.commit(&convo).await?;
        }

        let picture = entry
            .profile_picture
            .as_ref()
            .and_then(|p| ProfilePicture::usable(Some(p.url.as_str()), Some(p.key.as_slice())));
        self.profiles
            .update_profile_of_contact(&entry.id, entry.name.clone(), picture)
            .await
    }

    async fn handle_user_groups(&self, outcome: &MergeOutcome) -> Result<(), CoreError> {
        if !outcome.needs_dump {
            return Ok(());
        }
        let communities = self.handle_communities_update().await;
        let legacy = self
            .handle_legacy_group_update(outcome.latest_envelope_timestamp)
            .await;
        communities.and(legacy)
    }

    async fn local_conversations(
        &self,
        keep: fn(&Conversation) -> bool,
    ) -> Result<Vec<Conversation>, CoreError> {
        Ok(self
            .conversations
            .list()
            .await?
            .into_iter()
            .filter(|c| keep(c))
            .collect())
    }

    /// Diffs wrapper communities against local ones: joins the missing in
    /// the background, deletes the extra ones and syncs priority on the rest.
    async fn handle_communities_update(&self) -> Result<(), CoreError> {
        let in_wrapper = self.wrappers.communities().await?;
        let local = self.local_conversations(Conversation::is_community).await?;
        let local_ids: HashSet<String> = local.iter().map(|c| c.id.clone()).collect();

        let mut wrapper_ids = HashSet::new();
        let mut to_join = Vec::new();
        let mut to_sync = Vec::new();
        for entry in in_wrapper {
            let id = match entry.conversation_id() {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("skipping community {}: {}", entry.base_url, e);
                    continue;
                }
            };
            wrapper_ids.insert(id.clone());
            if local_ids.contains(&id) {
                to_sync.push((id, entry));
            } else {
                to_join.push((id, entry));
            }
        }
        let to_leave: Vec<&Conversation> =
            local.iter().filter(|c| !wrapper_ids.contains(&c.id)).collect();
        log::info!(
            "communities: {} to join, {} to leave",
            to_join.len(),
            to_leave.len()
        );

        for convo in to_leave {
            log::info!("leaving community {}", convo.id);
            if let Err(e) = self.conversations.delete(&convo.id).await {
                log::warn!("leaving community {} failed: {}", convo.id, e);
            }
        }

        for (id, entry) in to_join {
            log::info!("joining community {}", id);
            let joiner = self.joiner.clone();
            self.tasks
                .spawn(format!("join:{}", id), async move { joiner.join(entry).await })
                .await;
        }

        for (id, entry) in to_sync {
            let result = async {
                let Some(mut convo) = self.conversations.get(&id).await? else {
                    return Ok(());
                };
                if convo.priority != entry.priority {
                    convo.priority = entry.priority;
                    self.conversations.commit(&convo).await?;
                }
                Ok::<(), CoreError>(())
            }
            .await;
            if let Err(e) = result {
                log::warn!("community {} priority not synced: {}", id, e);
            }
        }
        Ok(())
    }

    async fn handle_legacy_group_update(&self, latest_envelope_timestamp: u64) -> Result<(), CoreError> {
        let in_wrapper = self.wrappers.legacy_groups().await?;
        let local = self.local_conversations(Conversation::is_closed_group).await?;
        let local_ids: HashSet<String> = local.iter().map(|c| c.id.clone()).collect();
        let wrapper_ids: HashSet<String> = in_wrapper.iter().map(|g| g.pubkey_hex.clone()).collect();

        let to_create: Vec<&LegacyGroupEntry> = in_wrapper
            .iter()
            .filter(|g| !local_ids.contains(&g.pubkey_hex))
            .collect();
        let to_leave: Vec<&Conversation> =
            local.iter().filter(|c| !wrapper_ids.contains(&c.id)).collect();
        log::info!(
            "legacy groups: {} to join, {} to leave",
            to_create.len(),
            to_leave.len()
        );

        for convo in to_leave {
            log::info!("leaving legacy group {} from config sync", convo.id);
            let result = async {
                self.groups.mark_group_as_left_or_kicked(&convo.id, false).await?;
                self.conversations.delete(&convo.id).await
            }
            .await;
            if let Err(e) = result {
                log::warn!("leaving legacy group {} failed: {}", convo.id, e);
            }
        }

        let mut created = HashSet::new();
        for entry in to_create {
            match self
                .conversations
                .get_or_create(&entry.pubkey_hex, ConversationKind::ClosedGroup)
                .await
            {
                Ok(_) => {
                    created.insert(entry.pubkey_hex.clone());
                    self.subscriptions.add_pubkey(&entry.pubkey_hex).await;
                }
                Err(e) => log::warn!("creating legacy group {} failed: {}", entry.pubkey_hex, e),
            }
        }

        for entry in &in_wrapper {
            let is_new = created.contains(&entry.pubkey_hex);
            if let Err(e) = self
                .apply_legacy_group(entry, is_new, latest_envelope_timestamp)
                .await
            {
                log::warn!("legacy group {} not reconciled: {}", entry.pubkey_hex, e);
            }
        }
        Ok(())
    }

    async fn apply_legacy_group(
        &self,
        entry: &LegacyGroupEntry,
        is_new: bool,
        latest_envelope_timestamp: u64,
    ) -> Result<(), CoreError> {
        let Some(existing) = self.conversations.get(&entry.pubkey_hex).await? else {
            log::warn!("legacy group {} should already exist", entry.pubkey_hex);
            return Ok(());
        };
        let active_at = if existing.active_at != 0 && existing.active_at < latest_envelope_timestamp {
            existing.active_at
        } else {
            latest_envelope_timestamp
        };
        let details = GroupDesiredState {
            id: entry.pubkey_hex.clone(),
            name: entry.name.clone(),
            members: entry.member_keys(),
            admins: if is_new { entry.admin_keys() } else { Vec::new() },
            zombies: existing.zombies.clone(),
            active_at,
            expire_timer: None,
            blocked: existing.blocked,
            we_were_just_added: false,
        };
        let mut convo = self.groups.update_or_create_closed_group(&details).await?;

        if convo.priority != entry.priority {
            convo.priority = entry.priority;
            self.conversations.commit(&convo).await?;
        }
        if convo.expire_timer != entry.disappearing_timer_seconds {
            self.groups
                .update_expire_timer(
                    &entry.pubkey_hex,
                    entry.disappearing_timer_seconds,
                    &self.our_key,
                    latest_envelope_timestamp,
                    true,
                )
                .await?;
        }

        if !entry.enc_pubkey_hex.is_empty() && !entry.enc_seckey_hex.is_empty() {
            let pair = HexKeyPair {
                public_hex: entry.enc_pubkey_hex.clone(),
                private_hex: entry.enc_seckey_hex.clone(),
            };
            if let Err(e) = self.groups.keyring().add_if_needed(&entry.pubkey_hex, pair).await {
                log::warn!("failed to save key pair for legacy group {}: {}", entry.pubkey_hex, e);
            }
        }
        Ok(())
    }

    /// Read state per conversation. One failing conversation or sub-kind
    /// never stops the others.
    async fn handle_convo_info_volatile(&self, outcome: &MergeOutcome) -> Result<(), CoreError> {
        if !outcome.needs_dump {
            return Ok(());
        }
        for kind in [
            VolatileKind::OneToOne,
            VolatileKind::Community,
            VolatileKind::LegacyGroup,
        ] {
            let entries = match self.wrappers.volatile(kind).await {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("volatile update of {:?} failed: {}", kind, e);
                    continue;
                }
            };
            for entry in entries {
                let id = match entry.conversation_id() {
                    Ok(id) => id,
                    Err(e) => {
                        log::warn!("volatile entry {:?} skipped: {}", entry.target, e);
                        continue;
                    }
                };
                if let Err(e) = self.apply_volatile(&id, entry.unread, entry.last_read).await {
                    log::warn!("volatile update of {} failed: {}", id, e);
                }
            }
        }
        Ok(())
    }

    async fn apply_volatile(
        &self,
        conversation_id: &str,
        forced_unread: bool,
        last_read: u64,
    ) -> Result<(), CoreError> {
        if self.conversations.get(conversation_id).await?.is_none() {
            return Ok(());
        }
        log::debug!(
            "volatile {}: forced_unread:{} last_read:{}",
            conversation_id,
            forced_unread,
            last_read
        );
        self.conversations
            .mark_read_until(conversation_id, last_read)
            .await?;
        let mut convo = self
            .conversations
            .get(conversation_id)
            .await?
            .ok_or(CoreError::NotFound)?;
        if convo.forced_unread != forced_unread {
            convo.forced_unread = forced_unread;
            self.conversations.commit(&convo).await?;
        }
        Ok(())
    }
}
