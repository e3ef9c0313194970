use async_trait::async_trait;
use snodesync_core::error::CoreError;
use snodesync_core::messaging::{MessageQueue, OutgoingControl, SnodeNamespace};
use snodesync_core::profile::AvatarFetcher;
use snodesync_core::reconcile::CommunityJoiner;
use snodesync_core::store::{ConversationKind, ConversationStore, ProfilePicture};
use snodesync_core::wrapper::CommunityEntry;
use std::sync::Arc;

/// The daemon has no store-message route; every send is refused so callers
/// never treat an undelivered control message as accepted.
#[derive(Clone, Default)]
pub struct UnroutedMessageQueue;

#[async_trait]
impl MessageQueue for UnroutedMessageQueue {
    async fn send_to_group(
        &self,
        group_id: &str,
        message: OutgoingControl,
        namespace: SnodeNamespace,
    ) -> Result<(), CoreError> {
        log::warn!(
            "no route for {} to group {} (namespace {})",
            message.identifier,
            group_id,
            namespace.id()
        );
        Err(CoreError::Transport("no_route".to_string()))
    }

    async fn send_to_pubkey(
        &self,
        recipient: &str,
        message: OutgoingControl,
        namespace: SnodeNamespace,
    ) -> Result<(), CoreError> {
        log::warn!(
            "no route for {} to {} (namespace {})",
            message.identifier,
            recipient,
            namespace.id()
        );
        Err(CoreError::Transport("no_route".to_string()))
    }
}

#[derive(Clone, Default)]
pub struct LoggingAvatarFetcher;

#[async_trait]
impl AvatarFetcher for LoggingAvatarFetcher {
    async fn fetch_avatar(
        &self,
        conversation_id: &str,
        picture: ProfilePicture,
    ) -> Result<(), CoreError> {
        log::info!("avatar for {} available at {}", conversation_id, picture.url);
        Ok(())
    }
}

/// Records joined communities in the local conversation store.
#[derive(Clone)]
pub struct LocalCommunityJoiner {
    conversations: Arc<dyn ConversationStore>,
}

impl LocalCommunityJoiner {
    pub fn new(conversations: Arc<dyn ConversationStore>) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl CommunityJoiner for LocalCommunityJoiner {
    async fn join(&self, community: CommunityEntry) -> Result<(), CoreError> {
        let id = community.conversation_id()?;
        let mut convo = self
            .conversations
            .get_or_create(&id, ConversationKind::Community)
            .await?;
        convo.priority = community.priority;
        convo.hidden = false;
        self.conversations.commit(&convo).await?;
        log::info!("joined community {}", id);
        Ok(())
    }
}
