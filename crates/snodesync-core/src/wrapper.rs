use crate::error::CoreError;
use crate::ids::community_conversation_id;
use crate::store::ProfilePicture;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Logical category of synced account state. Each namespace owns one
/// mergeable wrapper per account key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigNamespace {
    UserProfile,
    Contacts,
    UserGroups,
    ConvoInfoVolatile,
}

impl ConfigNamespace {
    pub const ALL: [ConfigNamespace; 4] = [
        ConfigNamespace::UserProfile,
        ConfigNamespace::Contacts,
        ConfigNamespace::UserGroups,
        ConfigNamespace::ConvoInfoVolatile,
    ];

    /// Message kind used for this namespace on the wire.
    pub fn kind(&self) -> u8 {
        match self {
            ConfigNamespace::UserProfile => 1,
            ConfigNamespace::Contacts => 2,
            ConfigNamespace::ConvoInfoVolatile => 3,
            ConfigNamespace::UserGroups => 4,
        }
    }

    pub fn from_kind(kind: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.kind() == kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigNamespace::UserProfile => "UserProfile",
            ConfigNamespace::Contacts => "Contacts",
            ConfigNamespace::UserGroups => "UserGroups",
            ConfigNamespace::ConvoInfoVolatile => "ConvoInfoVolatile",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigMergeInput {
    pub data: Vec<u8>,
    pub hash: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileEntry {
    pub name: Option<String>,
    pub picture: Option<ProfilePicture>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactEntry {
    pub id: String,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub profile_picture: Option<ProfilePicture>,
    pub priority: i32,
    pub approved: bool,
    pub approved_me: bool,
    pub blocked: bool,
    pub expiration_timer_seconds: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommunityEntry {
    pub base_url: String,
    pub room_case_preserved: String,
    pub pubkey_hex: String,
    pub priority: i32,
}

impl CommunityEntry {
    pub fn conversation_id(&self) -> Result<String, CoreError> {
        community_conversation_id(&self.base_url, &self.room_case_preserved)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyGroupMember {
    pub pubkey_hex: String,
    pub is_admin: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacyGroupEntry {
    pub pubkey_hex: String,
    pub name: String,
    pub members: Vec<LegacyGroupMember>,
    pub priority: i32,
    pub disappearing_timer_seconds: u32,
    pub enc_pubkey_hex: String,
    pub enc_seckey_hex: String,
}

impl LegacyGroupEntry {
    pub fn member_keys(&self) -> Vec<String> {
        self.members.iter().map(|m| m.pubkey_hex.clone()).collect()
    }

    pub fn admin_keys(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.is_admin)
            .map(|m| m.pubkey_hex.clone())
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolatileKind {
    OneToOne,
    Community,
    LegacyGroup,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolatileTarget {
    OneToOne { pubkey_hex: String },
    Community { base_url: String, room: String },
    LegacyGroup { pubkey_hex: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolatileEntry {
    pub target: VolatileTarget,
    pub unread: bool,
    pub last_read: u64,
}

impl VolatileEntry {
    pub fn kind(&self) -> VolatileKind {
        match self.target {
            VolatileTarget::OneToOne { .. } => VolatileKind::OneToOne,
            VolatileTarget::Community { .. } => VolatileKind::Community,
            VolatileTarget::LegacyGroup { .. } => VolatileKind::LegacyGroup,
        }
    }

    pub fn conversation_id(&self) -> Result<String, CoreError> {
        match &self.target {
            VolatileTarget::OneToOne { pubkey_hex } | VolatileTarget::LegacyGroup { pubkey_hex } => {
                Ok(pubkey_hex.clone())
            }
            VolatileTarget::Community { base_url, room } => community_conversation_id(base_url, room),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserGroupsState {
    pub communities: Vec<CommunityEntry>,
    pub legacy_groups: Vec<LegacyGroupEntry>,
}

/// Opaque mergeable state for every namespace of one account.
///
/// `merge` must be idempotent over hashes it has already seen. `snapshot`
/// captures everything including the push/dump flags and has no side
/// effects; `restore` puts such a snapshot back.
///
/// A merge batch holds the guard from `begin_batch` from its first
/// snapshot until its last restore. Local edits take the same guard, so
/// they never land between a snapshot and the restore that would undo them.
#[async_trait]
pub trait ConfigWrappers: Send + Sync {
    async fn begin_batch(&self) -> OwnedMutexGuard<()>;
    async fn merge(
        &self,
        namespace: ConfigNamespace,
        inputs: Vec<ConfigMergeInput>,
    ) -> Result<usize, CoreError>;
    async fn needs_push(&self, namespace: ConfigNamespace) -> Result<bool, CoreError>;
    async fn needs_dump(&self, namespace: ConfigNamespace) -> Result<bool, CoreError>;
    /// Serialises the wrapper for persistence and clears `needs_dump`.
    async fn dump(&self, namespace: ConfigNamespace) -> Result<Vec<u8>, CoreError>;
    async fn load(&self, namespace: ConfigNamespace, dump: &[u8]) -> Result<(), CoreError>;
    async fn snapshot(&self, namespace: ConfigNamespace) -> Result<Vec<u8>, CoreError>;
    async fn restore(&self, namespace: ConfigNamespace, snapshot: &[u8]) -> Result<(), CoreError>;

    async fn profile(&self) -> Result<ProfileEntry, CoreError>;
    async fn contacts(&self) -> Result<Vec<ContactEntry>, CoreError>;
    async fn communities(&self) -> Result<Vec<CommunityEntry>, CoreError>;
    async fn legacy_groups(&self) -> Result<Vec<LegacyGroupEntry>, CoreError>;
    async fn volatile(&self, kind: VolatileKind) -> Result<Vec<VolatileEntry>, CoreError>;
}

/// Payload carried by one config message of the reference wrapper.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfigPayload {
    pub seqno: u64,
    pub state: serde_json::Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
struct NamespaceDoc {
    seqno: u64,
    state: serde_json::Value,
    seen: BTreeSet<String>,
    needs_push: bool,
    needs_dump: bool,
}

#[derive(Serialize, Deserialize)]
struct DumpedDoc {
    seqno: u64,
    state: serde_json::Value,
    seen: BTreeSet<String>,
}

/// Last-writer-wins wrapper keyed on a per-namespace sequence number.
///
/// A higher incoming seqno replaces local state. A lower one means the
/// sender is behind and we must push. Equal seqnos with different states
/// resolve to the greater serialised state on every device, then bump the
/// seqno so the winner gets pushed.
#[derive(Clone, Default)]
pub struct LwwConfigWrappers {
    docs: Arc<Mutex<HashMap<ConfigNamespace, NamespaceDoc>>>,
    batch: Arc<Mutex<()>>,
}

fn merge_error(namespace: ConfigNamespace, reason: impl std::fmt::Display) -> CoreError {
    CoreError::MergePrimitive(format!("{}: {}", namespace.as_str(), reason))
}

fn read_state<T: DeserializeOwned + Default>(
    namespace: ConfigNamespace,
    value: &serde_json::Value,
) -> Result<T, CoreError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| merge_error(namespace, e))
}

impl LwwConfigWrappers {
    pub fn new() -> Self {
        Self::default()
    }

    async fn read<T: DeserializeOwned + Default>(
        &self,
        namespace: ConfigNamespace,
    ) -> Result<T, CoreError> {
        let docs = self.docs.lock().await;
        match docs.get(&namespace) {
            Some(doc) => read_state(namespace, &doc.state),
            None => Ok(T::default()),
        }
    }

    async fn update<T, F>(&self, namespace: ConfigNamespace, apply: F) -> Result<(), CoreError>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T),
    {
        let _batch = self.batch.lock().await;
        let mut docs = self.docs.lock().await;
        let doc = docs.entry(namespace).or_default();
        let mut state: T = read_state(namespace, &doc.state)?;
        apply(&mut state);
        doc.state = serde_json::to_value(&state).map_err(|e| merge_error(namespace, e))?;
        doc.seqno += 1;
        doc.needs_push = true;
        doc.needs_dump = true;
        Ok(())
    }

    pub async fn set_profile(&self, entry: ProfileEntry) -> Result<(), CoreError> {
        self.update(ConfigNamespace::UserProfile, |state: &mut ProfileEntry| {
            *state = entry
        })
        .await
    }

    pub async fn set_contact(&self, entry: ContactEntry) -> Result<(), CoreError> {
        self.update(ConfigNamespace::Contacts, |state: &mut Vec<ContactEntry>| {
            match state.iter_mut().find(|c| c.id == entry.id) {
                Some(existing) => *existing = entry,
                None => state.push(entry),
            }
        })
        .await
    }

    pub async fn remove_contact(&self, id: &str) -> Result<(), CoreError> {
        self.update(ConfigNamespace::Contacts, |state: &mut Vec<ContactEntry>| {
            state.retain(|c| c.id != id)
        })
        .await
    }

    pub async fn set_community(&self, entry: CommunityEntry) -> Result<(), CoreError> {
        let id = entry.conversation_id()?;
        self.update(ConfigNamespace::UserGroups, |state: &mut UserGroupsState| {
            state
                .communities
                .retain(|c| c.conversation_id().ok().as_deref() != Some(id.as_str()));
            state.communities.push(entry);
        })
        .await
    }

    pub async fn remove_community(&self, conversation_id: &str) -> Result<(), CoreError> {
        self.update(ConfigNamespace::UserGroups, |state: &mut UserGroupsState| {
            state
                .communities
                .retain(|c| c.conversation_id().ok().as_deref() != Some(conversation_id))
        })
        .await
    }

    pub async fn set_legacy_group(&self, entry: LegacyGroupEntry) -> Result<(), CoreError> {
        self.update(ConfigNamespace::UserGroups, |state: &mut UserGroupsState| {
            match state
                .legacy_groups
                .iter_mut()
                .find(|g| g.pubkey_hex == entry.pubkey_hex)
            {
                Some(existing) => *existing = entry,
                None => state.legacy_groups.push(entry),
            }
        })
        .await
    }

    pub async fn remove_legacy_group(&self, pubkey_hex: &str) -> Result<(), CoreError> {
        self.update(ConfigNamespace::UserGroups, |state: &mut UserGroupsState| {
            state.legacy_groups.retain(|g| g.pubkey_hex != pubkey_hex)
        })
        .await
    }

    pub async fn set_volatile(&self, entry: VolatileEntry) -> Result<(), CoreError> {
        self.update(
            ConfigNamespace::ConvoInfoVolatile,
            |state: &mut Vec<VolatileEntry>| {
                match state.iter_mut().find(|v| v.target == entry.target) {
                    Some(existing) => *existing = entry,
                    None => state.push(entry),
                }
            },
        )
        .await
    }

    /// Current state as a config message payload, with the seqno it carries.
    pub async fn push_payload(&self, namespace: ConfigNamespace) -> Result<(u64, Vec<u8>), CoreError> {
        let docs = self.docs.lock().await;
        let doc = docs.get(&namespace).cloned().unwrap_or_default();
        let payload = ConfigPayload {
            seqno: doc.seqno,
            state: doc.state,
        };
        let bytes = serde_json::to_vec(&payload).map_err(|e| merge_error(namespace, e))?;
        Ok((doc.seqno, bytes))
    }

    /// The push of `seqno` was stored under `hash`; nothing left to push
    /// unless the state moved on meanwhile.
    pub async fn confirm_pushed(&self, namespace: ConfigNamespace, seqno: u64, hash: &str) {
        let _batch = self.batch.lock().await;
        let mut docs = self.docs.lock().await;
        let doc = docs.entry(namespace).or_default();
        doc.seen.insert(hash.to_string());
        if doc.seqno == seqno {
            doc.needs_push = false;
        }
    }
}

#[async_trait]
impl ConfigWrappers for LwwConfigWrappers {
    async fn begin_batch(&self) -> OwnedMutexGuard<()> {
        self.batch.clone().lock_owned().await
    }

    async fn merge(
        &self,
        namespace: ConfigNamespace,
        inputs: Vec<ConfigMergeInput>,
    ) -> Result<usize, CoreError> {
        let mut docs = self.docs.lock().await;
        let doc = docs.entry(namespace).or_default();
        let mut accepted = 0;
        for input in inputs {
            if doc.seen.contains(&input.hash) {
                continue;
            }
            let payload: ConfigPayload =
                serde_json::from_slice(&input.data).map_err(|e| merge_error(namespace, e))?;
            doc.seen.insert(input.hash);
            accepted += 1;
            if payload.seqno > doc.seqno {
                doc.seqno = payload.seqno;
                doc.state = payload.state;
                doc.needs_dump = true;
            } else if payload.seqno < doc.seqno {
                doc.needs_push = true;
            } else if payload.state != doc.state {
                let ours = serde_json::to_string(&doc.state).map_err(|e| merge_error(namespace, e))?;
                let theirs =
                    serde_json::to_string(&payload.state).map_err(|e| merge_error(namespace, e))?;
                if theirs > ours {
                    doc.state = payload.state;
                    doc.needs_dump = true;
                }
                doc.seqno += 1;
                doc.needs_push = true;
            }
        }
        Ok(accepted)
    }

    async fn needs_push(&self, namespace: ConfigNamespace) -> Result<bool, CoreError> {
        let docs = self.docs.lock().await;
        Ok(docs.get(&namespace).map(|d| d.needs_push).unwrap_or(false))
    }

    async fn needs_dump(&self, namespace: ConfigNamespace) -> Result<bool, CoreError> {
        let docs = self.docs.lock().await;
        Ok(docs.get(&namespace).map(|d| d.needs_dump).unwrap_or(false))
    }

    async fn dump(&self, namespace: ConfigNamespace) -> Result<Vec<u8>, CoreError> {
        let mut docs = self.docs.lock().await;
        let doc = docs.entry(namespace).or_default();
        let dumped = DumpedDoc {
            seqno: doc.seqno,
            state: doc.state.clone(),
            seen: doc.seen.clone(),
        };
        let bytes = serde_json::to_vec(&dumped).map_err(|e| merge_error(namespace, e))?;
        doc.needs_dump = false;
        Ok(bytes)
    }

    async fn load(&self, namespace: ConfigNamespace, dump: &[u8]) -> Result<(), CoreError> {
        let dumped: DumpedDoc = serde_json::from_slice(dump).map_err(|e| merge_error(namespace, e))?;
        self.docs.lock().await.insert(
            namespace,
            NamespaceDoc {
                seqno: dumped.seqno,
                state: dumped.state,
                seen: dumped.seen,
                needs_push: false,
                needs_dump: false,
            },
        );
        Ok(())
    }

    async fn snapshot(&self, namespace: ConfigNamespace) -> Result<Vec<u8>, CoreError> {
        let docs = self.docs.lock().await;
        let doc = docs.get(&namespace).cloned().unwrap_or_default();
        serde_json::to_vec(&doc).map_err(|e| merge_error(namespace, e))
    }

    async fn restore(&self, namespace: ConfigNamespace, snapshot: &[u8]) -> Result<(), CoreError> {
        let doc: NamespaceDoc =
            serde_json::from_slice(snapshot).map_err(|e| merge_error(namespace, e))?;
        self.docs.lock().await.insert(namespace, doc);
        Ok(())
    }

    async fn profile(&self) -> Result<ProfileEntry, CoreError> {
        self.read(ConfigNamespace::UserProfile).await
    }

    async fn contacts(&self) -> Result<Vec<ContactEntry>, CoreError> {
        self.read(ConfigNamespace::Contacts).await
    }

    async fn communities(&self) -> Result<Vec<CommunityEntry>, CoreError> {
        let state: UserGroupsState = self.read(ConfigNamespace::UserGroups).await?;
        Ok(state.communities)
    }

    async fn legacy_groups(&self) -> Result<Vec<LegacyGroupEntry>, CoreError> {
        let state: UserGroupsState = self.read(ConfigNamespace::UserGroups).await?;
        Ok(state.legacy_groups)
    }

    async fn volatile(&self, kind: VolatileKind) -> Result<Vec<VolatileEntry>, CoreError> {
        let all: Vec<VolatileEntry> = self.read(ConfigNamespace::ConvoInfoVolatile).await?;
        Ok(all.into_iter().filter(|v| v.kind() == kind).collect())
    }
}
