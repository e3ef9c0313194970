use crate::error::CoreError;
use crate::ids::AccountKey;
use crate::store::KeyPairStore;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

const WRAP_CONTEXT: &[u8] = b"snodesync:group-keypair-wrap:v1";
const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Group encryption key pair, hex encoded the way it travels in config
/// entries and control messages.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HexKeyPair {
    pub public_hex: String,
    pub private_hex: String,
}

impl HexKeyPair {
    pub fn is_empty(&self) -> bool {
        self.public_hex.is_empty() || self.private_hex.is_empty()
    }
}

/// Key pair sealed to one member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeyPair {
    pub recipient: String,
    pub ciphertext: Vec<u8>,
}

pub trait GroupKeyCrypto: Send + Sync {
    fn generate_key_pair(&self) -> Result<HexKeyPair, CoreError>;
    fn wrap_for(&self, recipient: &AccountKey, pair: &HexKeyPair)
        -> Result<WrappedKeyPair, CoreError>;
}

/// Seals key pairs with an ephemeral x25519 exchange and XChaCha20-Poly1305.
#[derive(Clone, Default)]
pub struct X25519KeyWrapper;

impl X25519KeyWrapper {
    pub fn new() -> Self {
        Self
    }
}

fn derive_wrap_key(shared_secret: [u8; 32]) -> Result<[u8; 32], CoreError> {
    let hkdf = Hkdf::<Sha256>::new(None, &shared_secret);
    let mut out = [0u8; 32];
    hkdf.expand(WRAP_CONTEXT, &mut out)
        .map_err(|_| CoreError::Crypto)?;
    Ok(out)
}

impl GroupKeyCrypto for X25519KeyWrapper {
    fn generate_key_pair(&self) -> Result<HexKeyPair, CoreError> {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Ok(HexKeyPair {
            public_hex: hex::encode(public.as_bytes()),
            private_hex: hex::encode(secret.to_bytes()),
        })
    }

    fn wrap_for(
        &self,
        recipient: &AccountKey,
        pair: &HexKeyPair,
    ) -> Result<WrappedKeyPair, CoreError> {
        if pair.is_empty() {
            return Err(CoreError::KeyRotation("empty key pair".to_string()));
        }
        let recipient_key = recipient
            .x25519_bytes()
            .ok_or_else(|| CoreError::KeyRotation(format!("bad recipient {}", recipient)))?;
        let plaintext = serde_json::to_vec(pair).map_err(|_| CoreError::Crypto)?;
        let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let shared = ephemeral
            .diffie_hellman(&PublicKey::from(recipient_key))
            .to_bytes();
        let key = derive_wrap_key(shared)?;
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CoreError::Crypto)?;
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: recipient.as_str().as_bytes(),
                },
            )
            .map_err(|_| CoreError::KeyRotation("seal".to_string()))?;
        let mut ciphertext = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&ephemeral_public);
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);
        Ok(WrappedKeyPair {
            recipient: recipient.as_str().to_string(),
            ciphertext,
        })
    }
}

/// Opens a wrapped pair with the recipient's x25519 secret.
pub fn unwrap_key_pair(
    recipient_secret: [u8; 32],
    wrapped: &WrappedKeyPair,
) -> Result<HexKeyPair, CoreError> {
    if wrapped.ciphertext.len() <= EPHEMERAL_LEN + NONCE_LEN {
        return Err(CoreError::Crypto);
    }
    let (ephemeral, rest) = wrapped.ciphertext.split_at(EPHEMERAL_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);
    let mut ephemeral_public = [0u8; EPHEMERAL_LEN];
    ephemeral_public.copy_from_slice(ephemeral);
    let shared = StaticSecret::from(recipient_secret)
        .diffie_hellman(&PublicKey::from(ephemeral_public))
        .to_bytes();
    let key = derive_wrap_key(shared)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CoreError::Crypto)?;
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: wrapped.recipient.as_bytes(),
            },
        )
        .map_err(|_| CoreError::Crypto)?;
    serde_json::from_slice(&plaintext).map_err(|_| CoreError::Crypto)
}

/// Committed key pairs per group plus the pair currently being distributed.
#[derive(Clone)]
pub struct GroupKeyring {
    store: Arc<dyn KeyPairStore>,
    in_flight: Arc<Mutex<HashMap<String, HexKeyPair>>>,
}

impl GroupKeyring {
    pub fn new(store: Arc<dyn KeyPairStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Stores the pair unless the group already has it. Returns whether it
    /// was added.
    pub async fn add_if_needed(&self, group_id: &str, pair: HexKeyPair) -> Result<bool, CoreError> {
        if pair.is_empty() {
            return Err(CoreError::Validation("key_pair".to_string()));
        }
        let existing = self.store.key_pairs(group_id).await?;
        if existing.contains(&pair) {
            return Ok(false);
        }
        self.store.add_key_pair(group_id, pair).await?;
        Ok(true)
    }

    pub async fn latest(&self, group_id: &str) -> Result<Option<HexKeyPair>, CoreError> {
        Ok(self.store.key_pairs(group_id).await?.pop())
    }

    pub async fn all(&self, group_id: &str) -> Result<Vec<HexKeyPair>, CoreError> {
        self.store.key_pairs(group_id).await
    }

    /// Every pair worth trying when decrypting: committed ones, newest
    /// first, then the in-flight one.
    pub async fn candidate_key_pairs(&self, group_id: &str) -> Result<Vec<HexKeyPair>, CoreError> {
        let mut pairs = self.store.key_pairs(group_id).await?;
        pairs.reverse();
        if let Some(pending) = self.in_flight.lock().await.get(group_id) {
            if !pairs.contains(pending) {
                pairs.push(pending.clone());
            }
        }
        Ok(pairs)
    }

    pub async fn set_in_flight(&self, group_id: &str, pair: HexKeyPair) {
        self.in_flight
            .lock()
            .await
            .insert(group_id.to_string(), pair);
    }

    pub async fn in_flight(&self, group_id: &str) -> Option<HexKeyPair> {
        self.in_flight.lock().await.get(group_id).cloned()
    }

    pub async fn clear_in_flight(&self, group_id: &str) -> Option<HexKeyPair> {
        self.in_flight.lock().await.remove(group_id)
    }

    pub async fn remove_all(&self, group_id: &str) -> Result<(), CoreError> {
        self.store.remove_all(group_id).await
    }
}
