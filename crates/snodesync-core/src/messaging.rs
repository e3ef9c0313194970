use crate::error::CoreError;
use crate::group_crypto::{HexKeyPair, WrappedKeyPair};
use crate::time::now_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Storage namespace a message is stored under on the swarm.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SnodeNamespace {
    UserMessages,
    ClosedGroupMessage,
    UserConfig,
}

impl SnodeNamespace {
    pub fn id(&self) -> i16 {
        match self {
            SnodeNamespace::UserMessages => 0,
            SnodeNamespace::ClosedGroupMessage => -10,
            SnodeNamespace::UserConfig => 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupControlMessage {
    NameChange {
        name: String,
    },
    MembersAdded {
        members: Vec<String>,
    },
    MembersRemoved {
        members: Vec<String>,
    },
    MemberLeft,
    New {
        group_id: String,
        name: String,
        members: Vec<String>,
        admins: Vec<String>,
        key_pair: HexKeyPair,
        expire_timer: u32,
    },
    EncryptionKeyPair {
        group_id: String,
        wrappers: Vec<WrappedKeyPair>,
    },
    ExpirationTimerUpdate {
        seconds: u32,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingControl {
    pub identifier: String,
    pub sent_at: u64,
    pub message: GroupControlMessage,
}

impl OutgoingControl {
    pub fn new(message: GroupControlMessage) -> Self {
        Self {
            identifier: Uuid::new_v4().to_string(),
            sent_at: now_ms(),
            message,
        }
    }

    pub fn with_identifier(identifier: String, sent_at: u64, message: GroupControlMessage) -> Self {
        Self {
            identifier,
            sent_at,
            message,
        }
    }
}

/// Outbound send. `Ok` means the network confirmed it accepted the message.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send_to_group(
        &self,
        group_id: &str,
        message: OutgoingControl,
        namespace: SnodeNamespace,
    ) -> Result<(), CoreError>;
    async fn send_to_pubkey(
        &self,
        recipient: &str,
        message: OutgoingControl,
        namespace: SnodeNamespace,
    ) -> Result<(), CoreError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Group(String),
    Pubkey(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentControl {
    pub destination: Destination,
    pub message: OutgoingControl,
    pub namespace: SnodeNamespace,
}

#[derive(Default)]
struct MockQueueState {
    sent: Vec<SentControl>,
    attempts: usize,
    fail_all: bool,
    failing_destinations: HashSet<String>,
}

/// Records every send. Can be told to reject all sends or sends to given
/// destinations.
#[derive(Clone, Default)]
pub struct MockMessageQueue {
    state: Arc<Mutex<MockQueueState>>,
}

impl MockMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_all(&self, fail: bool) {
        self.state.lock().await.fail_all = fail;
    }

    pub async fn fail_destination(&self, destination: &str) {
        self.state
            .lock()
            .await
            .failing_destinations
            .insert(destination.to_string());
    }

    pub async fn sent(&self) -> Vec<SentControl> {
        self.state.lock().await.sent.clone()
    }

    /// Every send attempt, accepted or not.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }

    async fn record(
        &self,
        destination: Destination,
        message: OutgoingControl,
        namespace: SnodeNamespace,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        state.attempts += 1;
        let target = match &destination {
            Destination::Group(id) | Destination::Pubkey(id) => id.clone(),
        };
        if state.fail_all || state.failing_destinations.contains(&target) {
            return Err(CoreError::Transport(format!("send to {} rejected", target)));
        }
        state.sent.push(SentControl {
            destination,
            message,
            namespace,
        });
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for MockMessageQueue {
    async fn send_to_group(
        &self,
        group_id: &str,
        message: OutgoingControl,
        namespace: SnodeNamespace,
    ) -> Result<(), CoreError> {
        self.record(Destination::Group(group_id.to_string()), message, namespace)
            .await
    }

    async fn send_to_pubkey(
        &self,
        recipient: &str,
        message: OutgoingControl,
        namespace: SnodeNamespace,
    ) -> Result<(), CoreError> {
        self.record(Destination::Pubkey(recipient.to_string()), message, namespace)
            .await
    }
}
