use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Prefix carried by account keys on the wire in front of the x25519 key.
pub const ACCOUNT_KEY_PREFIX: &str = "05";

const COMMUNITY_ID_SEPARATOR: char = '@';

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountKey {
    value: String,
}

impl AccountKey {
    /// Accepts either a bare 64 char x25519 hex key or the 66 char prefixed form.
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let trimmed = hex_str.trim().to_lowercase();
        let body = match trimmed.len() {
            66 if trimmed.starts_with(ACCOUNT_KEY_PREFIX) => &trimmed[2..],
            64 => trimmed.as_str(),
            _ => return None,
        };
        if hex::decode(body).is_err() {
            return None;
        }
        Some(Self { value: trimmed })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Raw x25519 public key bytes, without the account prefix.
    pub fn x25519_bytes(&self) -> Option<[u8; 32]> {
        let body = if self.value.len() == 66 {
            &self.value[2..]
        } else {
            self.value.as_str()
        };
        let bytes = hex::decode(body).ok()?;
        bytes.try_into().ok()
    }
}

impl Display for AccountKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Conversation id of a community room. Stable for any casing of the room
/// or trailing slashes on the server url.
pub fn community_conversation_id(base_url: &str, room: &str) -> Result<String, CoreError> {
    let base = base_url.trim().trim_end_matches('/').to_lowercase();
    let room = room.trim().to_lowercase();
    if base.is_empty() || room.is_empty() {
        return Err(CoreError::Validation("community_id".to_string()));
    }
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(CoreError::Validation("community_url".to_string()));
    }
    Ok(format!("{}{}{}", room, COMMUNITY_ID_SEPARATOR, base))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenGroupRoom {
    pub server_url: String,
    pub room_id: String,
    pub server_public_key: String,
}

/// Parses `https://host[:port]/room?public_key=<64 hex>`.
pub fn parse_open_group_url(url: &str) -> Option<OpenGroupRoom> {
    let trimmed = url.trim();
    let (location, query) = trimmed.split_once('?')?;
    let public_key = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("public_key="))?
        .to_lowercase();
    if public_key.len() != 64 || hex::decode(&public_key).is_err() {
        return None;
    }
    let (server_url, room_id) = location.trim_end_matches('/').rsplit_once('/')?;
    if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
        return None;
    }
    if room_id.is_empty() || server_url.ends_with(':') || server_url.ends_with('/') {
        return None;
    }
    Some(OpenGroupRoom {
        server_url: server_url.to_string(),
        room_id: room_id.to_string(),
        server_public_key: public_key,
    })
}
