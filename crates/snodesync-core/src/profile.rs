use crate::error::CoreError;
use crate::event::{BackgroundTasks, CoreEvent, EventBus};
use crate::store::{
    get_last_profile_update_timestamp, set_last_profile_update_timestamp, ConversationKind,
    ConversationStore, ItemStore, ProfilePicture,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Downloads and decrypts a profile picture for a conversation.
#[async_trait]
pub trait AvatarFetcher: Send + Sync {
    async fn fetch_avatar(
        &self,
        conversation_id: &str,
        picture: ProfilePicture,
    ) -> Result<(), CoreError>;
}

/// Applies display names and avatars, ours and our contacts'.
#[derive(Clone)]
pub struct ProfileManager {
    our_key: String,
    conversations: Arc<dyn ConversationStore>,
    items: Arc<dyn ItemStore>,
    avatars: Arc<dyn AvatarFetcher>,
    events: EventBus,
    tasks: BackgroundTasks,
}

impl ProfileManager {
    pub fn new(
        our_key: String,
        conversations: Arc<dyn ConversationStore>,
        items: Arc<dyn ItemStore>,
        avatars: Arc<dyn AvatarFetcher>,
        events: EventBus,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            our_key,
            conversations,
            items,
            avatars,
            events,
            tasks,
        }
    }

    /// Applies our own profile as of `sent_at`. A profile older than the
    /// last applied one is ignored. Returns whether anything was applied.
    pub async fn apply_our_profile(
        &self,
        sent_at: u64,
        display_name: &str,
        picture: Option<ProfilePicture>,
    ) -> Result<bool, CoreError> {
        if let Some(last) = get_last_profile_update_timestamp(self.items.as_ref()).await? {
            if sent_at < last {
                log::info!(
                    "ignoring profile sent at {}, last update was at {}",
                    sent_at,
                    last
                );
                return Ok(false);
            }
        }
        let mut ours = self
            .conversations
            .get_or_create(&self.our_key, ConversationKind::Private)
            .await?;
        ours.display_name = Some(display_name.to_string());
        let fetch = self.swap_avatar(&mut ours.avatar, picture);
        self.conversations.commit(&ours).await?;
        set_last_profile_update_timestamp(self.items.as_ref(), sent_at).await?;
        if let Some(picture) = fetch {
            self.spawn_fetch(&self.our_key, picture).await;
        }

        if display_name.is_empty() {
            log::warn!("got a configuration message but the display name is empty");
        } else {
            self.events.publish(CoreEvent::ConfigurationMessageReceived {
                display_name: display_name.to_string(),
            });
        }
        Ok(true)
    }

    /// Sets a contact's name right away; the picture download is left to a
    /// background task.
    pub async fn update_profile_of_contact(
        &self,
        conversation_id: &str,
        name: Option<String>,
        picture: Option<ProfilePicture>,
    ) -> Result<(), CoreError> {
        let Some(mut convo) = self.conversations.get(conversation_id).await? else {
            return Ok(());
        };
        let mut changed = false;
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            if convo.display_name.as_deref() != Some(name.as_str()) {
                convo.display_name = Some(name);
                changed = true;
            }
        }
        let before = convo.avatar.clone();
        let fetch = self.swap_avatar(&mut convo.avatar, picture);
        changed |= before != convo.avatar;
        if changed {
            self.conversations.commit(&convo).await?;
        }
        if let Some(picture) = fetch {
            self.spawn_fetch(conversation_id, picture).await;
        }
        Ok(())
    }

    /// Replaces the stored descriptor and returns the picture to fetch, if
    /// it is new.
    fn swap_avatar(
        &self,
        current: &mut Option<ProfilePicture>,
        incoming: Option<ProfilePicture>,
    ) -> Option<ProfilePicture> {
        if *current == incoming {
            return None;
        }
        *current = incoming.clone();
        incoming
    }

    async fn spawn_fetch(&self, conversation_id: &str, picture: ProfilePicture) {
        let avatars = self.avatars.clone();
        let id = conversation_id.to_string();
        self.tasks
            .spawn(format!("avatar:{}", conversation_id), async move {
                avatars.fetch_avatar(&id, picture).await
            })
            .await;
    }
}
