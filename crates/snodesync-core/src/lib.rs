pub mod config;
pub mod error;
pub mod event;
pub mod group_crypto;
pub mod groups;
pub mod ids;
pub mod legacy;
pub mod merge;
pub mod messaging;
pub mod profile;
pub mod reconcile;
pub mod store;
pub mod swarm;
pub mod sync;
pub mod time;
pub mod wrapper;

#[cfg(test)]
mod tests;

use config::CoreConfig;
use error::CoreError;
use event::{BackgroundTasks, EventBus, EventReceiver};
use group_crypto::{GroupKeyCrypto, GroupKeyring};
use groups::ClosedGroups;
use ids::AccountKey;
use legacy::{LegacyConfigHandler, LegacyConfigurationMessage, LegacyEnvelope, LegacyOutcome};
use merge::{merge_incoming, IncomingConfigEnvelope};
use messaging::MessageQueue;
use profile::{AvatarFetcher, ProfileManager};
use reconcile::{CommunityJoiner, ReconcileReport, Reconciler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use store::{ConversationStore, ItemStore, KeyPairStore};
use swarm::{SeedNode, SnodeRpc, SubscriptionRegistry, SwarmDirectory};
use sync::ConfigSyncScheduler;
use wrapper::ConfigWrappers;

/// External collaborators the core is built on.
#[derive(Clone)]
pub struct CoreDeps {
    pub rpc: Arc<dyn SnodeRpc>,
    pub items: Arc<dyn ItemStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub key_pairs: Arc<dyn KeyPairStore>,
    pub wrappers: Arc<dyn ConfigWrappers>,
    pub queue: Arc<dyn MessageQueue>,
    pub crypto: Arc<dyn GroupKeyCrypto>,
    pub avatars: Arc<dyn AvatarFetcher>,
    pub joiner: Arc<dyn CommunityJoiner>,
}

#[derive(Clone)]
pub struct Core {
    config: CoreConfig,
    our_key: AccountKey,
    registration_done: Arc<AtomicBool>,
    wrappers: Arc<dyn ConfigWrappers>,
    swarm: SwarmDirectory,
    subscriptions: SubscriptionRegistry,
    scheduler: ConfigSyncScheduler,
    groups: ClosedGroups,
    profiles: ProfileManager,
    reconciler: Reconciler,
    legacy: LegacyConfigHandler,
    events: EventBus,
    tasks: BackgroundTasks,
}

impl Core {
    pub async fn init(
        config: CoreConfig,
        our_key: AccountKey,
        deps: CoreDeps,
    ) -> Result<Self, CoreError> {
        if config.seed_node_limit == 0 {
            return Err(CoreError::Validation("seed_node_limit".to_string()));
        }
        let key = our_key.as_str().to_string();
        let events = EventBus::new(256);
        let tasks = BackgroundTasks::new(events.clone());
        let registration_done = Arc::new(AtomicBool::new(config.registration_done));
        let subscriptions = SubscriptionRegistry::new();
        let scheduler = ConfigSyncScheduler::new();
        let swarm = SwarmDirectory::new(
            deps.rpc.clone(),
            deps.items.clone(),
            deps.conversations.clone(),
            key.clone(),
            SeedNode {
                url: config.seed_node_url.clone(),
                port: config.seed_node_port,
            },
            config.seed_node_limit,
            config.minimum_swarm_nodes,
        );
        let groups = ClosedGroups::new(
            key.clone(),
            deps.conversations.clone(),
            GroupKeyring::new(deps.key_pairs.clone()),
            deps.crypto.clone(),
            deps.queue.clone(),
            subscriptions.clone(),
        );
        let profiles = ProfileManager::new(
            key.clone(),
            deps.conversations.clone(),
            deps.items.clone(),
            deps.avatars.clone(),
            events.clone(),
            tasks.clone(),
        );
        let reconciler = Reconciler::new(
            key.clone(),
            deps.wrappers.clone(),
            deps.conversations.clone(),
            deps.items.clone(),
            profiles.clone(),
            groups.clone(),
            subscriptions.clone(),
            deps.joiner.clone(),
            scheduler.clone(),
            tasks.clone(),
        );
        let legacy = LegacyConfigHandler::new(
            key.clone(),
            config.sync_mode.clone(),
            registration_done.clone(),
            deps.items.clone(),
            deps.conversations.clone(),
            profiles.clone(),
            groups.clone(),
            subscriptions.clone(),
            deps.joiner.clone(),
            tasks.clone(),
        );
        let loaded = reconciler.load_dumps(&key).await?;
        log::info!("core ready for {}, {} config dumps loaded", key, loaded);
        subscriptions.add_pubkey(&key).await;
        Ok(Self {
            config,
            our_key,
            registration_done,
            wrappers: deps.wrappers,
            swarm,
            subscriptions,
            scheduler,
            groups,
            profiles,
            reconciler,
            legacy,
            events,
            tasks,
        })
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn our_key(&self) -> &AccountKey {
        &self.our_key
    }

    pub fn swarm(&self) -> &SwarmDirectory {
        &self.swarm
    }

    pub fn groups(&self) -> &ClosedGroups {
        &self.groups
    }

    pub fn profiles(&self) -> &ProfileManager {
        &self.profiles
    }

    pub fn scheduler(&self) -> &ConfigSyncScheduler {
        &self.scheduler
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn set_registration_done(&self, done: bool) {
        self.registration_done.store(done, Ordering::SeqCst);
    }

    /// Merges a batch of shared config messages and reconciles the result.
    /// A failed merge drops the whole batch and leaves the local mirrors
    /// untouched.
    pub async fn handle_config_messages(
        &self,
        envelopes: Vec<IncomingConfigEnvelope>,
    ) -> Result<ReconcileReport, CoreError> {
        if !self.config.sync_mode.shared_config_enabled() {
            log::debug!("shared config disabled, ignoring {} messages", envelopes.len());
            return Ok(ReconcileReport::default());
        }
        if envelopes.is_empty() {
            return Ok(ReconcileReport::default());
        }
        log::info!("handling {} shared config messages", envelopes.len());
        let outcomes =
            merge_incoming(self.wrappers.as_ref(), self.our_key.as_str(), envelopes).await?;
        Ok(self.reconciler.process_merge_results(&outcomes).await)
    }

    pub async fn handle_legacy_configuration_message(
        &self,
        envelope: &LegacyEnvelope,
        message: &LegacyConfigurationMessage,
    ) -> Result<LegacyOutcome, CoreError> {
        self.legacy.handle_configuration_message(envelope, message).await
    }

    /// Waits for background work and drops cached swarm state.
    pub async fn shutdown(&self) {
        self.tasks.drain().await;
        self.swarm.shutdown().await;
    }

    /// Waits for every background task spawned so far.
    pub async fn settle(&self) {
        self.tasks.drain().await;
    }
}
