use crate::error::CoreError;
use crate::store::{ConversationStore, ItemStore, StoredItem};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageNode {
    pub address: String,
    pub port: u16,
}

impl StorageNode {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl Display for StorageNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedNode {
    pub url: String,
    pub port: u16,
}

/// One node of our own swarm, with what we last pulled from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OurSwarmNode {
    pub node: StorageNode,
    pub last_synced_hash: Option<String>,
    pub last_known_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct LastHashRecord {
    hash: String,
    expires_at: u64,
}

#[async_trait]
pub trait SnodeRpc: Send + Sync {
    /// Fetches up to `limit` random service nodes from the seed directory.
    async fn get_n_service_nodes(
        &self,
        seed: &SeedNode,
        limit: usize,
    ) -> Result<Vec<StorageNode>, CoreError>;
    /// Asks `node` which storage nodes are responsible for `pubkey`.
    async fn get_snodes_for_pubkey(
        &self,
        node: &StorageNode,
        pubkey: &str,
    ) -> Result<Vec<StorageNode>, CoreError>;
}

type SwarmLookup = Shared<BoxFuture<'static, Result<Vec<StorageNode>, CoreError>>>;

/// Process-scoped swarm state: the random node pool, our swarm, contact
/// swarms and the in-flight lookups. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SwarmDirectory {
    rpc: Arc<dyn SnodeRpc>,
    items: Arc<dyn ItemStore>,
    conversations: Arc<dyn ConversationStore>,
    our_key: String,
    seed: SeedNode,
    seed_limit: usize,
    minimum_swarm_nodes: usize,
    pool: Arc<Mutex<Vec<StorageNode>>>,
    our_swarm: Arc<Mutex<HashMap<StorageNode, OurSwarmNode>>>,
    contact_swarms: Arc<Mutex<HashMap<String, Vec<StorageNode>>>>,
    pending: Arc<Mutex<HashMap<String, SwarmLookup>>>,
}

impl SwarmDirectory {
    pub fn new(
        rpc: Arc<dyn SnodeRpc>,
        items: Arc<dyn ItemStore>,
        conversations: Arc<dyn ConversationStore>,
        our_key: String,
        seed: SeedNode,
        seed_limit: usize,
        minimum_swarm_nodes: usize,
    ) -> Self {
        Self {
            rpc,
            items,
            conversations,
            our_key,
            seed,
            seed_limit,
            minimum_swarm_nodes,
            pool: Arc::new(Mutex::new(Vec::new())),
            our_swarm: Arc::new(Mutex::new(HashMap::new())),
            contact_swarms: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn our_key(&self) -> &str {
        &self.our_key
    }

    /// Drops every cached assignment and in-flight lookup.
    pub async fn shutdown(&self) {
        self.pool.lock().await.clear();
        self.our_swarm.lock().await.clear();
        self.contact_swarms.lock().await.clear();
        self.pending.lock().await.clear();
    }

    pub async fn random_storage_node(&self) -> Result<StorageNode, CoreError> {
        let mut pool = self.pool.lock().await;
        if pool.is_empty() {
            *pool = self.fetch_pool().await?;
        }
        pool.choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| CoreError::DirectoryUnavailable("empty pool".to_string()))
    }

    /// Replaces the pool with a fresh seed response. A failed refresh leaves
    /// the current pool untouched.
    pub async fn refresh_pool(&self) -> Result<usize, CoreError> {
        let fresh = self.fetch_pool().await?;
        let mut pool = self.pool.lock().await;
        *pool = fresh;
        Ok(pool.len())
    }

    pub async fn pool_len(&self) -> usize {
        self.pool.lock().await.len()
    }

    async fn fetch_pool(&self) -> Result<Vec<StorageNode>, CoreError> {
        let nodes = self
            .rpc
            .get_n_service_nodes(&self.seed, self.seed_limit)
            .await
            .map_err(|e| match e {
                CoreError::DirectoryUnavailable(reason) => CoreError::DirectoryUnavailable(reason),
                other => CoreError::DirectoryUnavailable(other.to_string()),
            })?;
        if nodes.is_empty() {
            return Err(CoreError::DirectoryUnavailable("seed returned no nodes".to_string()));
        }
        log::info!("random snode pool refreshed with {} nodes", nodes.len());
        Ok(nodes)
    }

    async fn evict_from_pool(&self, node: &StorageNode) {
        let mut pool = self.pool.lock().await;
        pool.retain(|n| n != node);
    }

    /// Swarm of any account. Our own swarm comes from the long-lived cache,
    /// anyone else's is a fresh coalesced lookup.
    pub async fn swarm_for(&self, account_key: &str) -> Result<Vec<StorageNode>, CoreError> {
        if account_key == self.our_key {
            let ours = self.our_swarm().await?;
            return Ok(ours.into_iter().map(|n| n.node).collect());
        }
        self.fresh_swarm_for(account_key).await
    }

    pub async fn our_swarm(&self) -> Result<Vec<OurSwarmNode>, CoreError> {
        let cached = self.cached_our_swarm().await;
        if cached.len() >= self.minimum_swarm_nodes.max(1) {
            return Ok(cached);
        }
        let nodes = self.fresh_swarm_for(&self.our_key.clone()).await?;
        self.replace_our_swarm(nodes).await?;
        Ok(self.cached_our_swarm().await)
    }

    pub async fn cached_our_swarm(&self) -> Vec<OurSwarmNode> {
        let guard = self.our_swarm.lock().await;
        let mut nodes: Vec<OurSwarmNode> = guard.values().cloned().collect();
        nodes.sort_by(|a, b| a.node.address.cmp(&b.node.address));
        nodes
    }

    async fn replace_our_swarm(&self, nodes: Vec<StorageNode>) -> Result<(), CoreError> {
        let mut fresh = HashMap::new();
        for node in nodes {
            let last_synced_hash = self.load_last_hash(&node).await?;
            fresh.insert(
                node.clone(),
                OurSwarmNode {
                    last_known_port: node.port,
                    node,
                    last_synced_hash,
                },
            );
        }
        *self.our_swarm.lock().await = fresh;
        Ok(())
    }

    /// One network lookup per key at a time; concurrent callers share it.
    pub async fn fresh_swarm_for(&self, account_key: &str) -> Result<Vec<StorageNode>, CoreError> {
        let lookup = {
            let mut pending = self.pending.lock().await;
            match pending.get(account_key) {
                Some(existing) => existing.clone(),
                None => {
                    let this = self.clone();
                    let key = account_key.to_string();
                    let shared = async move {
                        let result = this.lookup_swarm(&key).await;
                        this.pending.lock().await.remove(&key);
                        result
                    }
                    .boxed()
                    .shared();
                    pending.insert(account_key.to_string(), shared.clone());
                    shared
                }
            }
        };
        lookup.await
    }

    async fn lookup_swarm(&self, account_key: &str) -> Result<Vec<StorageNode>, CoreError> {
        let node = self.random_storage_node().await?;
        match self.rpc.get_snodes_for_pubkey(&node, account_key).await {
            Ok(nodes) => {
                log::debug!("swarm for {} has {} nodes", account_key, nodes.len());
                Ok(nodes)
            }
            Err(e) => {
                log::warn!("swarm lookup for {} via {} failed: {}", account_key, node, e);
                self.evict_from_pool(&node).await;
                Err(CoreError::SwarmLookupFailed(format!("{}: {}", account_key, e)))
            }
        }
    }

    /// Fresh lookup of a contact's swarm, written to the contact cache and to
    /// the contact's persisted list.
    pub async fn refresh_swarm_for(&self, account_key: &str) -> Result<Vec<StorageNode>, CoreError> {
        let nodes = self.fresh_swarm_for(account_key).await?;
        self.update_contact_swarm(account_key, nodes.clone()).await?;
        Ok(nodes)
    }

    pub async fn update_contact_swarm(
        &self,
        account_key: &str,
        nodes: Vec<StorageNode>,
    ) -> Result<(), CoreError> {
        let mut convo = self
            .conversations
            .get(account_key)
            .await?
            .ok_or(CoreError::NotFound)?;
        convo.swarm_nodes = nodes.clone();
        self.conversations.commit(&convo).await?;
        self.contact_swarms
            .lock()
            .await
            .insert(account_key.to_string(), nodes);
        Ok(())
    }

    pub async fn cached_contact_swarm(&self, account_key: &str) -> Option<Vec<StorageNode>> {
        self.contact_swarms.lock().await.get(account_key).cloned()
    }

    pub async fn persisted_swarm_for(
        &self,
        account_key: &str,
    ) -> Result<Vec<StorageNode>, CoreError> {
        let convo = self
            .conversations
            .get(account_key)
            .await?
            .ok_or(CoreError::NotFound)?;
        Ok(convo.swarm_nodes)
    }

    pub async fn mark_unreachable(
        &self,
        account_key: &str,
        node: &StorageNode,
    ) -> Result<(), CoreError> {
        if account_key == self.our_key {
            self.our_swarm.lock().await.remove(node);
            log::info!("dropped unreachable node {} from our swarm", node);
            return Ok(());
        }
        if let Some(cached) = self.contact_swarms.lock().await.get_mut(account_key) {
            cached.retain(|n| n != node);
        }
        let Some(mut convo) = self.conversations.get(account_key).await? else {
            return Ok(());
        };
        if convo.swarm_nodes.contains(node) {
            convo.swarm_nodes.retain(|n| n != node);
            self.conversations.commit(&convo).await?;
            log::info!("dropped unreachable node {} from swarm of {}", node, account_key);
        }
        Ok(())
    }

    /// Remembers the newest hash pulled from one of our swarm nodes. Nodes
    /// outside the cached swarm are ignored.
    pub async fn record_last_synced_hash(
        &self,
        node: &StorageNode,
        hash: &str,
        expires_at: u64,
    ) -> Result<(), CoreError> {
        if !self.our_swarm.lock().await.contains_key(node) {
            return Ok(());
        }
        let record = LastHashRecord {
            hash: hash.to_string(),
            expires_at,
        };
        self.items
            .set_item(StoredItem {
                id: last_hash_key(node),
                value: serde_json::to_value(&record).map_err(|_| CoreError::Storage)?,
                timestamp: Some(expires_at),
            })
            .await?;
        if let Some(entry) = self.our_swarm.lock().await.get_mut(node) {
            entry.last_synced_hash = Some(record.hash);
        }
        Ok(())
    }

    async fn load_last_hash(&self, node: &StorageNode) -> Result<Option<String>, CoreError> {
        let item = self.items.get_item(&last_hash_key(node)).await?;
        Ok(item
            .and_then(|i| serde_json::from_value::<LastHashRecord>(i.value).ok())
            .map(|r| r.hash))
    }
}

fn last_hash_key(node: &StorageNode) -> String {
    format!("lastHash:{}", node.address)
}

/// Account keys whose swarms are currently polled.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_pubkey(&self, key: &str) {
        self.keys.lock().await.insert(key.to_string());
    }

    pub async fn remove_pubkey(&self, key: &str) {
        self.keys.lock().await.remove(key);
    }

    pub async fn is_polled(&self, key: &str) -> bool {
        self.keys.lock().await.contains(key)
    }

    pub async fn polled(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keys.lock().await.iter().cloned().collect();
        keys.sort();
        keys
    }
}
