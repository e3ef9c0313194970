use crate::error::CoreError;
use crate::group_crypto::HexKeyPair;
use crate::swarm::StorageNode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const HAS_SYNCED_INITIAL_CONFIGURATION_ITEM: &str = "hasSyncedInitialConfigurationItem";
pub const LAST_PROFILE_UPDATE_TIMESTAMP: &str = "lastProfileUpdateTimestamp";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredItem {
    pub id: String,
    pub value: serde_json::Value,
    pub timestamp: Option<u64>,
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn get_item(&self, id: &str) -> Result<Option<StoredItem>, CoreError>;
    async fn set_item(&self, item: StoredItem) -> Result<(), CoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryItemStore {
    items: Arc<Mutex<HashMap<String, StoredItem>>>,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn get_item(&self, id: &str) -> Result<Option<StoredItem>, CoreError> {
        Ok(self.items.lock().await.get(id).cloned())
    }

    async fn set_item(&self, item: StoredItem) -> Result<(), CoreError> {
        self.items.lock().await.insert(item.id.clone(), item);
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct StoredItems {
    entries: HashMap<String, StoredItem>,
}

/// Item store persisted as one JSON document per namespace.
#[derive(Clone)]
pub struct JsonFileItemStore {
    path: PathBuf,
    data: Arc<Mutex<StoredItems>>,
}

impl JsonFileItemStore {
    pub fn open_or_create(dir: impl AsRef<Path>, namespace: &str) -> Result<Self, CoreError> {
        let mut path = dir.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|_| CoreError::Storage)?;
        path.push(format!("{}-items.json", namespace));
        let data = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|_| CoreError::Storage)?;
            serde_json::from_str(&content).map_err(|_| CoreError::Storage)?
        } else {
            StoredItems::default()
        };
        Ok(Self {
            path,
            data: Arc::new(Mutex::new(data)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ItemStore for JsonFileItemStore {
    async fn get_item(&self, id: &str) -> Result<Option<StoredItem>, CoreError> {
        Ok(self.data.lock().await.entries.get(id).cloned())
    }

    async fn set_item(&self, item: StoredItem) -> Result<(), CoreError> {
        let mut guard = self.data.lock().await;
        guard.entries.insert(item.id.clone(), item);
        let serialized = serde_json::to_string_pretty(&*guard).map_err(|_| CoreError::Storage)?;
        fs::write(&self.path, serialized).map_err(|_| CoreError::Storage)
    }
}

pub async fn get_last_profile_update_timestamp(
    items: &dyn ItemStore,
) -> Result<Option<u64>, CoreError> {
    Ok(items
        .get_item(LAST_PROFILE_UPDATE_TIMESTAMP)
        .await?
        .and_then(|item| item.value.as_u64()))
}

pub async fn set_last_profile_update_timestamp(
    items: &dyn ItemStore,
    timestamp: u64,
) -> Result<(), CoreError> {
    items
        .set_item(StoredItem {
            id: LAST_PROFILE_UPDATE_TIMESTAMP.to_string(),
            value: serde_json::Value::from(timestamp),
            timestamp: Some(timestamp),
        })
        .await
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConversationKind {
    Private,
    ClosedGroup,
    Community,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfilePicture {
    pub url: String,
    pub key: Vec<u8>,
}

impl ProfilePicture {
    /// Only a picture with both a url and a key can be fetched.
    pub fn usable(url: Option<&str>, key: Option<&[u8]>) -> Option<Self> {
        match (url, key) {
            (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => Some(Self {
                url: url.to_string(),
                key: key.to_vec(),
            }),
            _ => None,
        }
    }
}

/// Local mirror of one conversation. Only the fields the sync core reads or
/// writes are modelled.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub display_name: Option<String>,
    pub nickname: Option<String>,
    pub avatar: Option<ProfilePicture>,
    pub priority: i32,
    pub approved: bool,
    pub approved_me: bool,
    pub blocked: bool,
    pub expire_timer: u32,
    pub members: Vec<String>,
    pub admins: Vec<String>,
    pub zombies: Vec<String>,
    pub active_at: u64,
    pub left: bool,
    pub is_kicked: bool,
    pub last_joined_timestamp: u64,
    pub hidden: bool,
    pub forced_unread: bool,
    pub unread_count: u32,
    pub last_read_timestamp: u64,
    pub swarm_nodes: Vec<StorageNode>,
}

impl Conversation {
    pub fn new(id: &str, kind: ConversationKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            display_name: None,
            nickname: None,
            avatar: None,
            priority: 0,
            approved: false,
            approved_me: false,
            blocked: false,
            expire_timer: 0,
            members: Vec::new(),
            admins: Vec::new(),
            zombies: Vec::new(),
            active_at: 0,
            left: false,
            is_kicked: false,
            last_joined_timestamp: 0,
            hidden: true,
            forced_unread: false,
            unread_count: 0,
            last_read_timestamp: 0,
            swarm_nodes: Vec::new(),
        }
    }

    pub fn is_closed_group(&self) -> bool {
        self.kind == ConversationKind::ClosedGroup
    }

    pub fn is_community(&self) -> bool {
        self.kind == ConversationKind::Community
    }

    pub fn is_admin(&self, key: &str) -> bool {
        self.admins.iter().any(|a| a == key)
    }

    /// An incoming request: they approved us, we never approved them.
    pub fn is_incoming_request(&self) -> bool {
        self.kind == ConversationKind::Private && !self.approved && self.approved_me
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub joined: Option<Vec<String>>,
    pub left: Option<Vec<String>>,
    pub kicked: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimelineKind {
    Text(String),
    GroupUpdate(GroupUpdate),
    ExpirationTimerUpdate { seconds: u32, from_sync: bool },
    OutgoingApproval,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEntry {
    pub id: String,
    pub sent_at: u64,
    pub sender: String,
    pub outgoing: bool,
    pub read: bool,
    pub kind: TimelineKind,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Conversation>, CoreError>;
    async fn get_or_create(&self, id: &str, kind: ConversationKind)
        -> Result<Conversation, CoreError>;
    async fn list(&self) -> Result<Vec<Conversation>, CoreError>;
    async fn commit(&self, conversation: &Conversation) -> Result<(), CoreError>;
    /// Removes the conversation and its timeline.
    async fn delete(&self, id: &str) -> Result<(), CoreError>;
    async fn add_message(&self, id: &str, entry: TimelineEntry) -> Result<String, CoreError>;
    async fn messages(&self, id: &str) -> Result<Vec<TimelineEntry>, CoreError>;
    async fn delete_messages(&self, id: &str) -> Result<(), CoreError>;
    /// Marks every incoming message sent at or before `timestamp` as read and
    /// returns the recomputed unread count.
    async fn mark_read_until(&self, id: &str, timestamp: u64) -> Result<u32, CoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryConversations {
    inner: Arc<Mutex<HashMap<String, (Conversation, Vec<TimelineEntry>)>>>,
}

impl InMemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversations {
    async fn get(&self, id: &str) -> Result<Option<Conversation>, CoreError> {
        Ok(self.inner.lock().await.get(id).map(|(c, _)| c.clone()))
    }

    async fn get_or_create(
        &self,
        id: &str,
        kind: ConversationKind,
    ) -> Result<Conversation, CoreError> {
        if id.trim().is_empty() {
            return Err(CoreError::Validation("conversation_id".to_string()));
        }
        let mut guard = self.inner.lock().await;
        let entry = guard
            .entry(id.to_string())
            .or_insert_with(|| (Conversation::new(id, kind), Vec::new()));
        Ok(entry.0.clone())
    }

    async fn list(&self) -> Result<Vec<Conversation>, CoreError> {
        let guard = self.inner.lock().await;
        let mut all: Vec<Conversation> = guard.values().map(|(c, _)| c.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn commit(&self, conversation: &Conversation) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().await;
        match guard.get_mut(&conversation.id) {
            Some(entry) => entry.0 = conversation.clone(),
            None => {
                guard.insert(conversation.id.clone(), (conversation.clone(), Vec::new()));
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CoreError> {
        self.inner.lock().await.remove(id);
        Ok(())
    }

    async fn add_message(&self, id: &str, entry: TimelineEntry) -> Result<String, CoreError> {
        let mut guard = self.inner.lock().await;
        let (convo, timeline) = guard.get_mut(id).ok_or(CoreError::NotFound)?;
        if !entry.outgoing && !entry.read {
            convo.unread_count = convo.unread_count.saturating_add(1);
        }
        let message_id = entry.id.clone();
        timeline.push(entry);
        Ok(message_id)
    }

    async fn messages(&self, id: &str) -> Result<Vec<TimelineEntry>, CoreError> {
        let guard = self.inner.lock().await;
        Ok(guard.get(id).map(|(_, t)| t.clone()).unwrap_or_default())
    }

    async fn delete_messages(&self, id: &str) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().await;
        if let Some((convo, timeline)) = guard.get_mut(id) {
            timeline.clear();
            convo.unread_count = 0;
        }
        Ok(())
    }

    async fn mark_read_until(&self, id: &str, timestamp: u64) -> Result<u32, CoreError> {
        let mut guard = self.inner.lock().await;
        let (convo, timeline) = guard.get_mut(id).ok_or(CoreError::NotFound)?;
        for entry in timeline.iter_mut() {
            if !entry.outgoing && entry.sent_at <= timestamp {
                entry.read = true;
            }
        }
        let unread = timeline.iter().filter(|e| !e.outgoing && !e.read).count() as u32;
        convo.unread_count = unread;
        convo.last_read_timestamp = convo.last_read_timestamp.max(timestamp);
        Ok(unread)
    }
}

#[async_trait]
pub trait KeyPairStore: Send + Sync {
    /// Every stored pair for the group, oldest first.
    async fn key_pairs(&self, group_id: &str) -> Result<Vec<HexKeyPair>, CoreError>;
    async fn add_key_pair(&self, group_id: &str, pair: HexKeyPair) -> Result<(), CoreError>;
    async fn remove_all(&self, group_id: &str) -> Result<(), CoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryKeyPairs {
    pairs: Arc<Mutex<HashMap<String, Vec<HexKeyPair>>>>,
}

impl InMemoryKeyPairs {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyPairStore for InMemoryKeyPairs {
    async fn key_pairs(&self, group_id: &str) -> Result<Vec<HexKeyPair>, CoreError> {
        Ok(self
            .pairs
            .lock()
            .await
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_key_pair(&self, group_id: &str, pair: HexKeyPair) -> Result<(), CoreError> {
        self.pairs
            .lock()
            .await
            .entry(group_id.to_string())
            .or_default()
            .push(pair);
        Ok(())
    }

    async fn remove_all(&self, group_id: &str) -> Result<(), CoreError> {
        self.pairs.lock().await.remove(group_id);
        Ok(())
    }
}
