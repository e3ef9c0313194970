use crate::error::CoreError;
use crate::group_crypto::{GroupKeyCrypto, GroupKeyring};
use crate::ids::AccountKey;
use crate::messaging::{GroupControlMessage, MessageQueue, OutgoingControl, SnodeNamespace};
use crate::store::{
    Conversation, ConversationKind, ConversationStore, GroupUpdate, TimelineEntry, TimelineKind,
};
use crate::swarm::SubscriptionRegistry;
use crate::time::now_ms;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// What a closed group should look like, either as asked for by the local
/// user or as read from synced configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupDesiredState {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    /// Empty means "leave the stored admins alone".
    pub admins: Vec<String>,
    pub zombies: Vec<String>,
    pub active_at: u64,
    pub expire_timer: Option<u32>,
    pub blocked: bool,
    pub we_were_just_added: bool,
}

impl GroupDesiredState {
    pub fn from_conversation(convo: &Conversation) -> Self {
        Self {
            id: convo.id.clone(),
            name: convo.display_name.clone().unwrap_or_default(),
            members: convo.members.clone(),
            admins: convo.admins.clone(),
            zombies: convo.zombies.clone(),
            active_at: convo.active_at,
            expire_timer: Some(convo.expire_timer),
            blocked: convo.blocked,
            we_were_just_added: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupDiff {
    pub new_name: Option<String>,
    pub joining_members: Option<Vec<String>>,
    pub leaving_members: Option<Vec<String>>,
    pub kicked_members: Option<Vec<String>>,
}

impl GroupDiff {
    pub fn is_empty(&self) -> bool {
        self.new_name.is_none()
            && self.joining_members.is_none()
            && self.leaving_members.is_none()
            && self.kicked_members.is_none()
    }
}

impl From<&GroupDiff> for GroupUpdate {
    fn from(diff: &GroupDiff) -> Self {
        GroupUpdate {
            name: diff.new_name.clone(),
            joined: diff.joining_members.clone(),
            left: diff.leaving_members.clone(),
            kicked: diff.kicked_members.clone(),
        }
    }
}

fn uniq(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

fn non_empty(items: Vec<String>) -> Option<Vec<String>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Name and membership difference between two states. Zombies count as
/// members on both sides; admins are never diffed.
pub fn compute_diff(old: &GroupDesiredState, new: &GroupDesiredState) -> GroupDiff {
    let old_all = uniq(old.members.iter().chain(old.zombies.iter()).cloned());
    let new_all = uniq(new.members.iter().chain(new.zombies.iter()).cloned());
    let joining: Vec<String> = new_all
        .iter()
        .filter(|m| !old_all.contains(m))
        .cloned()
        .collect();
    let leaving: Vec<String> = old_all
        .iter()
        .filter(|m| !new_all.contains(m))
        .cloned()
        .collect();
    GroupDiff {
        new_name: (old.name != new.name).then(|| new.name.clone()),
        joining_members: non_empty(joining),
        leaving_members: non_empty(leaving),
        kicked_members: None,
    }
}

/// Closed-group membership protocol for one local account.
#[derive(Clone)]
pub struct ClosedGroups {
    our_key: String,
    conversations: Arc<dyn ConversationStore>,
    keyring: GroupKeyring,
    crypto: Arc<dyn GroupKeyCrypto>,
    queue: Arc<dyn MessageQueue>,
    subscriptions: SubscriptionRegistry,
}

impl ClosedGroups {
    pub fn new(
        our_key: String,
        conversations: Arc<dyn ConversationStore>,
        keyring: GroupKeyring,
        crypto: Arc<dyn GroupKeyCrypto>,
        queue: Arc<dyn MessageQueue>,
        subscriptions: SubscriptionRegistry,
    ) -> Self {
        Self {
            our_key,
            conversations,
            keyring,
            crypto,
            queue,
            subscriptions,
        }
    }

    pub fn keyring(&self) -> &GroupKeyring {
        &self.keyring
    }

    async fn group(&self, group_id: &str) -> Result<Conversation, CoreError> {
        self.conversations
            .get(group_id)
            .await?
            .ok_or(CoreError::NotFound)
    }

    /// Records a group change in the timeline, outgoing when we made it.
    pub async fn add_update_message(
        &self,
        group_id: &str,
        update: GroupUpdate,
        sender: &str,
        sent_at: u64,
    ) -> Result<String, CoreError> {
        let outgoing = sender == self.our_key;
        self.conversations
            .add_message(
                group_id,
                TimelineEntry {
                    id: Uuid::new_v4().to_string(),
                    sent_at,
                    sender: sender.to_string(),
                    outgoing,
                    read: outgoing,
                    kind: TimelineKind::GroupUpdate(update),
                },
            )
            .await
    }

    pub async fn update_or_create_closed_group(
        &self,
        details: &GroupDesiredState,
    ) -> Result<Conversation, CoreError> {
        let mut convo = self
            .conversations
            .get_or_create(&details.id, ConversationKind::ClosedGroup)
            .await?;
        if convo.kind != ConversationKind::ClosedGroup {
            return Err(CoreError::Validation(format!("{} is not a group", details.id)));
        }
        convo.display_name = Some(details.name.clone());
        convo.members = details.members.clone();
        convo.active_at = details.active_at;
        convo.left = details.active_at == 0;
        convo.last_joined_timestamp = if details.active_at > 0 && details.we_were_just_added {
            now_ms()
        } else {
            details.active_at
        };
        convo.hidden = false;
        convo.blocked = details.blocked;
        if !details.admins.is_empty() {
            convo.admins = details.admins.clone();
        }
        self.conversations.commit(&convo).await?;

        if let Some(seconds) = details.expire_timer {
            let our_key = self.our_key.clone();
            self.update_expire_timer(&details.id, seconds, &our_key, now_ms(), true)
                .await?;
            return self.group(&details.id).await;
        }
        Ok(convo)
    }

    /// Changes a conversation's disappearing timer. Local changes are sent
    /// to the conversation; sync-originated ones only land in the timeline.
    pub async fn update_expire_timer(
        &self,
        conversation_id: &str,
        seconds: u32,
        source: &str,
        sent_at: u64,
        from_sync: bool,
    ) -> Result<bool, CoreError> {
        let mut convo = self.group(conversation_id).await?;
        if convo.expire_timer == seconds {
            return Ok(false);
        }
        convo.expire_timer = seconds;
        self.conversations.commit(&convo).await?;
        let outgoing = source == self.our_key;
        let message_id = self
            .conversations
            .add_message(
                conversation_id,
                TimelineEntry {
                    id: Uuid::new_v4().to_string(),
                    sent_at,
                    sender: source.to_string(),
                    outgoing,
                    read: outgoing,
                    kind: TimelineKind::ExpirationTimerUpdate { seconds, from_sync },
                },
            )
            .await?;
        if from_sync {
            return Ok(true);
        }
        let message = OutgoingControl::with_identifier(
            message_id,
            sent_at,
            GroupControlMessage::ExpirationTimerUpdate { seconds },
        );
        if convo.is_closed_group() {
            self.queue
                .send_to_group(conversation_id, message, SnodeNamespace::ClosedGroupMessage)
                .await?;
        } else {
            self.queue
                .send_to_pubkey(conversation_id, message, SnodeNamespace::UserMessages)
                .await?;
        }
        Ok(true)
    }

    /// Local user edit of a group's name and members. Writes the new state,
    /// then sends one message per part of the diff. Every part is attempted;
    /// the first failure is returned.
    pub async fn initiate_update(
        &self,
        group_id: &str,
        name: &str,
        members: Vec<String>,
    ) -> Result<GroupDiff, CoreError> {
        let convo = self
            .conversations
            .get_or_create(group_id, ConversationKind::ClosedGroup)
            .await?;
        if !convo.is_closed_group() {
            return Err(CoreError::Validation(format!("{} is not a group", group_id)));
        }
        let zombies: Vec<String> = convo
            .zombies
            .iter()
            .filter(|z| members.contains(z))
            .cloned()
            .collect();
        let desired = GroupDesiredState {
            id: group_id.to_string(),
            name: name.to_string(),
            members: members.clone(),
            admins: Vec::new(),
            zombies: zombies.clone(),
            active_at: now_ms(),
            expire_timer: Some(convo.expire_timer),
            blocked: convo.blocked,
            we_were_just_added: false,
        };
        let diff = compute_diff(&GroupDesiredState::from_conversation(&convo), &desired);
        if let Some(leaving) = &diff.leaving_members {
            check_removal(&convo, &self.our_key, leaving, &members)?;
        }

        let mut updated = self.update_or_create_closed_group(&desired).await?;
        updated.zombies = zombies;
        self.conversations.commit(&updated).await?;

        let full_state = GroupDesiredState {
            admins: updated.admins.clone(),
            ..desired
        };
        let our_key = self.our_key.clone();
        let mut first_error: Option<CoreError> = None;

        if let Some(new_name) = diff.new_name.clone().filter(|n| !n.is_empty()) {
            let update = GroupUpdate {
                name: Some(new_name.clone()),
                ..GroupUpdate::default()
            };
            let result = match self.add_update_message(group_id, update, &our_key, now_ms()).await {
                Ok(message_id) => self.send_new_name(group_id, &new_name, message_id).await,
                Err(e) => Err(e),
            };
            note_failure(&mut first_error, "name change", result);
        }

        if let Some(joining) = diff.joining_members.clone() {
            let update = GroupUpdate {
                joined: Some(joining.clone()),
                ..GroupUpdate::default()
            };
            let result = match self.add_update_message(group_id, update, &our_key, now_ms()).await {
                Ok(message_id) => {
                    self.send_added_members(group_id, &joining, message_id, &full_state)
                        .await
                }
                Err(e) => Err(e),
            };
            note_failure(&mut first_error, "added members", result);
        }

        if let Some(leaving) = diff.leaving_members.clone() {
            let update = GroupUpdate {
                kicked: Some(leaving.clone()),
                ..GroupUpdate::default()
            };
            let result = match self.add_update_message(group_id, update, &our_key, now_ms()).await {
                Ok(message_id) => {
                    self.send_removed_members(group_id, &leaving, &members, Some(message_id))
                        .await
                }
                Err(e) => Err(e),
            };
            note_failure(&mut first_error, "removed members", result);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(diff),
        }
    }

    pub async fn send_new_name(
        &self,
        group_id: &str,
        name: &str,
        message_id: String,
    ) -> Result<(), CoreError> {
        if name.is_empty() {
            log::warn!("no name given for update of group {}, skipping", group_id);
            return Ok(());
        }
        let message = OutgoingControl::with_identifier(
            message_id,
            now_ms(),
            GroupControlMessage::NameChange {
                name: name.to_string(),
            },
        );
        self.queue
            .send_to_group(group_id, message, SnodeNamespace::ClosedGroupMessage)
            .await
    }

    /// Tells the group who joined, then hands every new member the full
    /// group state. The per-member sends run concurrently and a failed one
    /// does not affect the others.
    pub async fn send_added_members(
        &self,
        group_id: &str,
        added: &[String],
        message_id: String,
        state: &GroupDesiredState,
    ) -> Result<(), CoreError> {
        if added.is_empty() {
            log::warn!("no added members given for group {}, skipping", group_id);
            return Ok(());
        }
        let key_pair = self
            .keyring
            .latest(group_id)
            .await?
            .ok_or(CoreError::NotFound)?;
        let convo = self.group(group_id).await?;

        let added_message = OutgoingControl::with_identifier(
            message_id.clone(),
            now_ms(),
            GroupControlMessage::MembersAdded {
                members: added.to_vec(),
            },
        );
        self.queue
            .send_to_group(group_id, added_message, SnodeNamespace::ClosedGroupMessage)
            .await?;

        let new_group = OutgoingControl::with_identifier(
            message_id,
            now_ms(),
            GroupControlMessage::New {
                group_id: group_id.to_string(),
                name: state.name.clone(),
                members: state.members.clone(),
                admins: state.admins.clone(),
                key_pair,
                expire_timer: convo.expire_timer,
            },
        );
        let sends = added.iter().map(|member| {
            let message = new_group.clone();
            async move {
                self.conversations
                    .get_or_create(member, ConversationKind::Private)
                    .await?;
                self.queue
                    .send_to_pubkey(member, message, SnodeNamespace::ClosedGroupMessage)
                    .await
            }
        });
        let results = join_all(sends).await;
        for (member, result) in added.iter().zip(results) {
            if let Err(e) = result {
                log::warn!("sending group {} to new member {} failed: {}", group_id, member, e);
            }
        }
        Ok(())
    }

    /// Sends the removal to the group. Once the network accepted it, an
    /// admin rotates the group key for `still_members`.
    pub async fn send_removed_members(
        &self,
        group_id: &str,
        removed: &[String],
        still_members: &[String],
        message_id: Option<String>,
    ) -> Result<(), CoreError> {
        if removed.is_empty() {
            log::warn!("no removed members given for group {}, skipping", group_id);
            return Ok(());
        }
        let convo = self.group(group_id).await?;
        check_removal(&convo, &self.our_key, removed, still_members)?;
        let is_admin = convo.is_admin(&self.our_key);
        let message = OutgoingControl::with_identifier(
            message_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            now_ms(),
            GroupControlMessage::MembersRemoved {
                members: removed.to_vec(),
            },
        );
        self.queue
            .send_to_group(group_id, message, SnodeNamespace::ClosedGroupMessage)
            .await?;

        if is_admin {
            log::info!(
                "members removed from {} and we are admin, rotating its encryption key pair",
                group_id
            );
            if let Err(e) = self.rotate_encryption_key_pair(group_id, still_members).await {
                log::warn!("key rotation for {} failed: {}", group_id, e);
            }
        }
        Ok(())
    }

    /// Generates a new group key pair, seals it for every target member and
    /// sends the bundle to the group. The pair is only committed once the
    /// send is confirmed. Callers that are not admin get a no-op.
    pub async fn rotate_encryption_key_pair(
        &self,
        group_id: &str,
        targets: &[String],
    ) -> Result<(), CoreError> {
        let Some(convo) = self.conversations.get(group_id).await? else {
            log::warn!("rotate key pair: conversation {} not found", group_id);
            return Ok(());
        };
        if !convo.is_closed_group() {
            log::warn!("rotate key pair: {} is not a closed group", group_id);
            return Ok(());
        }
        if !convo.is_admin(&self.our_key) {
            log::warn!("rotate key pair: not admin of {}", group_id);
            return Ok(());
        }

        let pair = self
            .crypto
            .generate_key_pair()
            .map_err(|e| CoreError::KeyRotation(format!("generate: {}", e)))?;
        let mut wrappers = Vec::with_capacity(targets.len());
        for target in targets {
            let recipient = AccountKey::from_hex(target)
                .ok_or_else(|| CoreError::KeyRotation(format!("bad member key {}", target)))?;
            let wrapped = self.crypto.wrap_for(&recipient, &pair).map_err(|e| match e {
                CoreError::KeyRotation(reason) => CoreError::KeyRotation(reason),
                other => CoreError::KeyRotation(format!("wrap: {}", other)),
            })?;
            wrappers.push(wrapped);
        }

        let message = OutgoingControl::new(GroupControlMessage::EncryptionKeyPair {
            group_id: group_id.to_string(),
            wrappers,
        });
        self.keyring.set_in_flight(group_id, pair.clone()).await;
        let sent = self
            .queue
            .send_to_group(group_id, message, SnodeNamespace::ClosedGroupMessage)
            .await;
        self.keyring.clear_in_flight(group_id).await;
        sent?;
        log::info!("key pair message for {} sent, saving the new pair", group_id);
        self.keyring.add_if_needed(group_id, pair).await?;
        Ok(())
    }

    /// Leaves a group. Local teardown only happens once the network accepted
    /// our leaving message.
    pub async fn leave_group(&self, group_id: &str) -> Result<(), CoreError> {
        let mut convo = match self.conversations.get(group_id).await? {
            Some(convo) if convo.is_closed_group() => convo,
            _ => {
                log::error!("cannot leave non-existing group {}", group_id);
                return Err(CoreError::NotFound);
            }
        };
        if convo.is_admin(&self.our_key) {
            log::info!("admin left closed group {}, dissolving it", group_id);
            convo.left = true;
            convo.members.clear();
            convo.admins.clear();
        } else {
            let our_key = self.our_key.clone();
            convo.members.retain(|m| *m != our_key);
        }
        self.conversations.commit(&convo).await?;

        let our_key = self.our_key.clone();
        let sent_at = now_ms();
        let message_id = self
            .add_update_message(
                group_id,
                GroupUpdate {
                    left: Some(vec![our_key]),
                    ..GroupUpdate::default()
                },
                &self.our_key,
                sent_at,
            )
            .await?;
        let message =
            OutgoingControl::with_identifier(message_id, sent_at, GroupControlMessage::MemberLeft);
        log::info!("leaving group {}, sending our leaving message", group_id);
        self.queue
            .send_to_group(group_id, message, SnodeNamespace::ClosedGroupMessage)
            .await?;
        log::info!("leaving message for {} sent, removing its local state", group_id);
        self.mark_group_as_left_or_kicked(group_id, false).await
    }

    pub async fn mark_group_as_left_or_kicked(
        &self,
        group_id: &str,
        is_kicked: bool,
    ) -> Result<(), CoreError> {
        self.keyring.remove_all(group_id).await?;
        if let Some(mut convo) = self.conversations.get(group_id).await? {
            if is_kicked {
                convo.is_kicked = true;
            } else {
                convo.left = true;
            }
            self.conversations.commit(&convo).await?;
        }
        self.keyring.clear_in_flight(group_id).await;
        self.subscriptions.remove_pubkey(group_id).await;
        Ok(())
    }
}

/// Removal rules: we leave through `leave_group`, and the first admin only
/// goes when everyone goes.
fn check_removal(
    convo: &Conversation,
    our_key: &str,
    removed: &[String],
    still_members: &[String],
) -> Result<(), CoreError> {
    if removed.iter().any(|m| m == our_key) {
        return Err(CoreError::GroupProtocolViolation(
            "cannot remove ourselves, leave the group instead".to_string(),
        ));
    }
    if let Some(first_admin) = convo.admins.first() {
        if removed.contains(first_admin) && !still_members.is_empty() {
            return Err(CoreError::GroupProtocolViolation(
                "cannot remove the admin without removing everyone".to_string(),
            ));
        }
    }
    Ok(())
}

fn note_failure(first_error: &mut Option<CoreError>, step: &str, result: Result<(), CoreError>) {
    if let Err(e) = result {
        log::warn!("group update step {} failed: {}", step, e);
        if first_error.is_none() {
            *first_error = Some(e);
        }
    }
}
