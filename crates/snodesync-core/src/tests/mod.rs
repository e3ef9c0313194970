pub mod groups_tests;

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::group_crypto::{GroupKeyCrypto, HexKeyPair, WrappedKeyPair, X25519KeyWrapper};
use crate::ids::AccountKey;
use crate::merge::IncomingConfigEnvelope;
use crate::messaging::MockMessageQueue;
use crate::profile::AvatarFetcher;
use crate::reconcile::CommunityJoiner;
use crate::store::{
    Conversation, ConversationKind, ConversationStore, InMemoryConversations, InMemoryItemStore,
    InMemoryKeyPairs, ProfilePicture, TimelineEntry,
};
use crate::swarm::{SeedNode, SnodeRpc, StorageNode};
use crate::wrapper::{
    CommunityEntry, ConfigMergeInput, ConfigNamespace, ConfigPayload, ConfigWrappers, ContactEntry,
    LegacyGroupEntry, LwwConfigWrappers, ProfileEntry, VolatileEntry, VolatileKind,
};
use crate::{Core, CoreDeps};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

pub fn account(byte: u8) -> String {
    format!("05{}", hex::encode([byte; 32]))
}

pub fn our_key() -> String {
    account(0x11)
}

pub fn node(i: u8) -> StorageNode {
    StorageNode::new(format!("10.0.0.{}", i), 22021)
}

pub fn config_envelope(
    namespace: ConfigNamespace,
    seqno: u64,
    state: serde_json::Value,
    hash: &str,
    timestamp: u64,
) -> IncomingConfigEnvelope {
    IncomingConfigEnvelope {
        namespace,
        payload: serde_json::to_vec(&ConfigPayload { seqno, state }).expect("payload"),
        message_hash: hash.to_string(),
        envelope_timestamp: timestamp,
    }
}

#[derive(Default)]
struct RpcState {
    seed_calls: usize,
    swarm_calls: usize,
    fail_seed: bool,
    fail_swarm: bool,
    seed_nodes: Vec<StorageNode>,
    swarms: HashMap<String, Vec<StorageNode>>,
}

#[derive(Clone, Default)]
pub struct MockSnodeRpc {
    state: Arc<Mutex<RpcState>>,
    delay: Duration,
}

impl MockSnodeRpc {
    pub fn new(seed_nodes: Vec<StorageNode>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RpcState {
                seed_nodes,
                ..RpcState::default()
            })),
            delay: Duration::from_millis(30),
        }
    }

    pub async fn set_swarm(&self, key: &str, nodes: Vec<StorageNode>) {
        self.state.lock().await.swarms.insert(key.to_string(), nodes);
    }

    pub async fn set_fail_seed(&self, fail: bool) {
        self.state.lock().await.fail_seed = fail;
    }

    pub async fn set_fail_swarm(&self, fail: bool) {
        self.state.lock().await.fail_swarm = fail;
    }

    pub async fn seed_calls(&self) -> usize {
        self.state.lock().await.seed_calls
    }

    pub async fn swarm_calls(&self) -> usize {
        self.state.lock().await.swarm_calls
    }
}

#[async_trait]
impl SnodeRpc for MockSnodeRpc {
    async fn get_n_service_nodes(
        &self,
        _seed: &SeedNode,
        limit: usize,
    ) -> Result<Vec<StorageNode>, CoreError> {
        let mut state = self.state.lock().await;
        state.seed_calls += 1;
        if state.fail_seed {
            return Err(CoreError::Transport("seed down".to_string()));
        }
        Ok(state.seed_nodes.iter().take(limit).cloned().collect())
    }

    async fn get_snodes_for_pubkey(
        &self,
        _node: &StorageNode,
        pubkey: &str,
    ) -> Result<Vec<StorageNode>, CoreError> {
        let (fail, nodes) = {
            let mut state = self.state.lock().await;
            state.swarm_calls += 1;
            (state.fail_swarm, state.swarms.get(pubkey).cloned().unwrap_or_default())
        };
        tokio::time::sleep(self.delay).await;
        if fail {
            return Err(CoreError::Transport("snode down".to_string()));
        }
        Ok(nodes)
    }
}

/// Joins by creating the community conversation, like a successful join.
#[derive(Clone)]
pub struct RecordingJoiner {
    conversations: Arc<dyn ConversationStore>,
    joined: Arc<Mutex<Vec<CommunityEntry>>>,
}

impl RecordingJoiner {
    pub fn new(conversations: Arc<dyn ConversationStore>) -> Self {
        Self {
            conversations,
            joined: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn joined(&self) -> Vec<CommunityEntry> {
        self.joined.lock().await.clone()
    }
}

#[async_trait]
impl CommunityJoiner for RecordingJoiner {
    async fn join(&self, community: CommunityEntry) -> Result<(), CoreError> {
        let id = community.conversation_id()?;
        let mut convo = self
            .conversations
            .get_or_create(&id, ConversationKind::Community)
            .await?;
        convo.priority = community.priority;
        self.conversations.commit(&convo).await?;
        self.joined.lock().await.push(community);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingAvatars {
    fetched: Arc<Mutex<Vec<(String, ProfilePicture)>>>,
}

impl RecordingAvatars {
    pub async fn fetched(&self) -> Vec<(String, ProfilePicture)> {
        self.fetched.lock().await.clone()
    }
}

#[async_trait]
impl AvatarFetcher for RecordingAvatars {
    async fn fetch_avatar(
        &self,
        conversation_id: &str,
        picture: ProfilePicture,
    ) -> Result<(), CoreError> {
        self.fetched
            .lock()
            .await
            .push((conversation_id.to_string(), picture));
        Ok(())
    }
}

/// Wrapper that fails merges for chosen namespaces and counts merge calls.
#[derive(Clone, Default)]
pub struct FailingWrappers {
    pub inner: LwwConfigWrappers,
    failing: Arc<Mutex<HashSet<ConfigNamespace>>>,
    merge_calls: Arc<Mutex<HashMap<ConfigNamespace, usize>>>,
    held: Arc<Mutex<Option<MergeHold>>>,
}

/// Parks a namespace's merge until `release` is notified. `entered` fires
/// once the merge is parked.
#[derive(Clone, Default)]
pub struct MergeHold {
    pub namespace: Option<ConfigNamespace>,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl FailingWrappers {
    pub async fn fail_merge(&self, namespace: ConfigNamespace) {
        self.failing.lock().await.insert(namespace);
    }

    pub async fn hold_merge(&self, namespace: ConfigNamespace) -> MergeHold {
        let hold = MergeHold {
            namespace: Some(namespace),
            ..MergeHold::default()
        };
        *self.held.lock().await = Some(hold.clone());
        hold
    }

    pub async fn merge_calls(&self, namespace: ConfigNamespace) -> usize {
        self.merge_calls
            .lock()
            .await
            .get(&namespace)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ConfigWrappers for FailingWrappers {
    async fn begin_batch(&self) -> OwnedMutexGuard<()> {
        self.inner.begin_batch().await
    }

    async fn merge(
        &self,
        namespace: ConfigNamespace,
        inputs: Vec<ConfigMergeInput>,
    ) -> Result<usize, CoreError> {
        *self.merge_calls.lock().await.entry(namespace).or_default() += 1;
        let hold = self.held.lock().await.clone();
        if let Some(hold) = hold.filter(|h| h.namespace == Some(namespace)) {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        let accepted = self.inner.merge(namespace, inputs).await?;
        if self.failing.lock().await.contains(&namespace) {
            return Err(CoreError::MergePrimitive(format!("{:?} exploded", namespace)));
        }
        Ok(accepted)
    }

    async fn needs_push(&self, namespace: ConfigNamespace) -> Result<bool, CoreError> {
        self.inner.needs_push(namespace).await
    }

    async fn needs_dump(&self, namespace: ConfigNamespace) -> Result<bool, CoreError> {
        self.inner.needs_dump(namespace).await
    }

    async fn dump(&self, namespace: ConfigNamespace) -> Result<Vec<u8>, CoreError> {
        self.inner.dump(namespace).await
    }

    async fn load(&self, namespace: ConfigNamespace, dump: &[u8]) -> Result<(), CoreError> {
        self.inner.load(namespace, dump).await
    }

    async fn snapshot(&self, namespace: ConfigNamespace) -> Result<Vec<u8>, CoreError> {
        self.inner.snapshot(namespace).await
    }

    async fn restore(&self, namespace: ConfigNamespace, snapshot: &[u8]) -> Result<(), CoreError> {
        self.inner.restore(namespace, snapshot).await
    }

    async fn profile(&self) -> Result<ProfileEntry, CoreError> {
        self.inner.profile().await
    }

    async fn contacts(&self) -> Result<Vec<ContactEntry>, CoreError> {
        self.inner.contacts().await
    }

    async fn communities(&self) -> Result<Vec<CommunityEntry>, CoreError> {
        self.inner.communities().await
    }

    async fn legacy_groups(&self) -> Result<Vec<LegacyGroupEntry>, CoreError> {
        self.inner.legacy_groups().await
    }

    async fn volatile(&self, kind: VolatileKind) -> Result<Vec<VolatileEntry>, CoreError> {
        self.inner.volatile(kind).await
    }
}

/// Conversation store whose `mark_read_until` fails for chosen ids.
#[derive(Clone, Default)]
pub struct FlakyConversations {
    pub inner: InMemoryConversations,
    failing_reads: Arc<Mutex<HashSet<String>>>,
}

impl FlakyConversations {
    pub async fn fail_mark_read(&self, id: &str) {
        self.failing_reads.lock().await.insert(id.to_string());
    }
}

#[async_trait]
impl ConversationStore for FlakyConversations {
    async fn get(&self, id: &str) -> Result<Option<Conversation>, CoreError> {
        self.inner.get(id).await
    }

    async fn get_or_create(
        &self,
        id: &str,
        kind: ConversationKind,
    ) -> Result<Conversation, CoreError> {
        self.inner.get_or_create(id, kind).await
    }

    async fn list(&self) -> Result<Vec<Conversation>, CoreError> {
        self.inner.list().await
    }

    async fn commit(&self, conversation: &Conversation) -> Result<(), CoreError> {
        self.inner.commit(conversation).await
    }

    async fn delete(&self, id: &str) -> Result<(), CoreError> {
        self.inner.delete(id).await
    }

    async fn add_message(&self, id: &str, entry: TimelineEntry) -> Result<String, CoreError> {
        self.inner.add_message(id, entry).await
    }

    async fn messages(&self, id: &str) -> Result<Vec<TimelineEntry>, CoreError> {
        self.inner.messages(id).await
    }

    async fn delete_messages(&self, id: &str) -> Result<(), CoreError> {
        self.inner.delete_messages(id).await
    }

    async fn mark_read_until(&self, id: &str, timestamp: u64) -> Result<u32, CoreError> {
        if self.failing_reads.lock().await.contains(id) {
            return Err(CoreError::Storage);
        }
        self.inner.mark_read_until(id, timestamp).await
    }
}

/// Real key wrapping with a generation counter and switchable failures.
#[derive(Clone, Default)]
pub struct CountingCrypto {
    inner: X25519KeyWrapper,
    generated: Arc<std::sync::Mutex<usize>>,
    fail_wrap: Arc<std::sync::atomic::AtomicBool>,
}

impl CountingCrypto {
    pub fn generated(&self) -> usize {
        self.generated.lock().map(|g| *g).unwrap_or(0)
    }

    pub fn set_fail_wrap(&self, fail: bool) {
        self.fail_wrap
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl GroupKeyCrypto for CountingCrypto {
    fn generate_key_pair(&self) -> Result<HexKeyPair, CoreError> {
        if let Ok(mut generated) = self.generated.lock() {
            *generated += 1;
        }
        self.inner.generate_key_pair()
    }

    fn wrap_for(
        &self,
        recipient: &AccountKey,
        pair: &HexKeyPair,
    ) -> Result<WrappedKeyPair, CoreError> {
        if self.fail_wrap.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoreError::KeyRotation("wrap refused".to_string()));
        }
        self.inner.wrap_for(recipient, pair)
    }
}

pub struct TestHarness {
    pub core: Core,
    pub rpc: MockSnodeRpc,
    pub items: Arc<InMemoryItemStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub key_pairs: Arc<InMemoryKeyPairs>,
    pub queue: MockMessageQueue,
    pub crypto: CountingCrypto,
    pub joiner: RecordingJoiner,
    pub avatars: RecordingAvatars,
}

pub fn test_config() -> CoreConfig {
    CoreConfig {
        seed_node_url: "seed.test".to_string(),
        seed_node_port: 4433,
        ..CoreConfig::default()
    }
}

pub async fn harness() -> (TestHarness, LwwConfigWrappers) {
    let wrappers = LwwConfigWrappers::new();
    let h = harness_with(
        test_config(),
        Arc::new(wrappers.clone()),
        Arc::new(InMemoryConversations::new()),
    )
    .await;
    (h, wrappers)
}

pub async fn harness_with(
    config: CoreConfig,
    wrappers: Arc<dyn ConfigWrappers>,
    conversations: Arc<dyn ConversationStore>,
) -> TestHarness {
    let rpc = MockSnodeRpc::new((1..=5).map(node).collect());
    let items = Arc::new(InMemoryItemStore::new());
    let key_pairs = Arc::new(InMemoryKeyPairs::new());
    let queue = MockMessageQueue::new();
    let crypto = CountingCrypto::default();
    let joiner = RecordingJoiner::new(conversations.clone());
    let avatars = RecordingAvatars::default();
    let our_key = AccountKey::from_hex(&our_key()).expect("our key");
    let core = Core::init(
        config,
        our_key,
        CoreDeps {
            rpc: Arc::new(rpc.clone()),
            items: items.clone(),
            conversations: conversations.clone(),
            key_pairs: key_pairs.clone(),
            wrappers,
            queue: Arc::new(queue.clone()),
            crypto: Arc::new(crypto.clone()),
            avatars: Arc::new(avatars.clone()),
            joiner: Arc::new(joiner.clone()),
        },
    )
    .await
    .expect("core init");
    TestHarness {
        core,
        rpc,
        items,
        conversations,
        key_pairs,
        queue,
        crypto,
        joiner,
        avatars,
    }
}

/// Stores a closed group with the given admins and members.
pub async fn seed_group(
    conversations: &Arc<dyn ConversationStore>,
    id: &str,
    admins: Vec<String>,
    members: Vec<String>,
) -> Conversation {
    let mut convo = conversations
        .get_or_create(id, ConversationKind::ClosedGroup)
        .await
        .expect("group");
    convo.display_name = Some("crew".to_string());
    convo.admins = admins;
    convo.members = members;
    convo.active_at = 1;
    conversations.commit(&convo).await.expect("commit");
    convo
}
