use async_trait::async_trait;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use snodesync_core::error::CoreError;
use snodesync_core::swarm::{SeedNode, SnodeRpc, StorageNode};
use std::time::Duration;

const UNROUTABLE_IP: &str = "0.0.0.0";

/// JSON-RPC client for the seed directory and the storage nodes.
///
/// Storage nodes serve self-signed certificates, so the node client skips
/// certificate verification; the seed client does not.
pub struct SnodeHttpClient {
    seed_http: reqwest::Client,
    node_http: reqwest::Client,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct SeedResponse {
    result: SeedResult,
}

#[derive(Deserialize)]
struct SeedResult {
    #[serde(default)]
    service_node_states: Vec<ServiceNodeState>,
}

#[derive(Deserialize)]
struct ServiceNodeState {
    public_ip: String,
    storage_port: u16,
}

#[derive(Deserialize)]
struct SwarmResponse {
    #[serde(default)]
    snodes: Vec<SwarmMember>,
}

#[derive(Deserialize)]
struct SwarmMember {
    ip: String,
    port: Value,
}

impl SnodeHttpClient {
    pub fn new() -> Result<Self, CoreError> {
        let seed_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| CoreError::Transport("client".to_string()))?;
        let node_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|_| CoreError::Transport("client".to_string()))?;
        Ok(Self {
            seed_http,
            node_http,
        })
    }

    async fn parse_json<T: for<'de> Deserialize<'de>>(&self, resp: Response) -> Result<T, CoreError> {
        if !resp.status().is_success() {
            return Err(CoreError::Transport(format!(
                "status_{}",
                resp.status().as_u16()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|_| CoreError::Transport("decode".to_string()))
    }
}

pub fn seed_url(seed: &SeedNode) -> String {
    format!("{}:{}/json_rpc", seed.url.trim_end_matches('/'), seed.port)
}

pub fn storage_rpc_url(node: &StorageNode) -> String {
    format!("https://{}:{}/storage_rpc/v1", node.address, node.port)
}

fn seed_nodes(states: Vec<ServiceNodeState>) -> Vec<StorageNode> {
    states
        .into_iter()
        .filter(|s| s.public_ip != UNROUTABLE_IP && !s.public_ip.is_empty())
        .map(|s| StorageNode::new(s.public_ip, s.storage_port))
        .collect()
}

fn swarm_nodes(members: Vec<SwarmMember>) -> Vec<StorageNode> {
    members
        .into_iter()
        .filter(|m| m.ip != UNROUTABLE_IP && !m.ip.is_empty())
        .filter_map(|m| {
            let port = match &m.port {
                Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
                Value::String(s) => s.parse::<u16>().ok(),
                _ => None,
            }?;
            Some(StorageNode::new(m.ip, port))
        })
        .collect()
}

#[async_trait]
impl SnodeRpc for SnodeHttpClient {
    async fn get_n_service_nodes(
        &self,
        seed: &SeedNode,
        limit: usize,
    ) -> Result<Vec<StorageNode>, CoreError> {
        let payload = JsonRpcRequest {
            jsonrpc: "2.0",
            id: "0",
            method: "get_n_service_nodes",
            params: json!({
                "active_only": true,
                "limit": limit,
                "fields": { "public_ip": true, "storage_port": true },
            }),
        };
        let resp = self
            .seed_http
            .post(seed_url(seed))
            .json(&payload)
            .send()
            .await
            .map_err(|_| CoreError::Transport("get_n_service_nodes".to_string()))?;
        let parsed: SeedResponse = self.parse_json(resp).await?;
        Ok(seed_nodes(parsed.result.service_node_states))
    }

    async fn get_snodes_for_pubkey(
        &self,
        node: &StorageNode,
        pubkey: &str,
    ) -> Result<Vec<StorageNode>, CoreError> {
        let payload = JsonRpcRequest {
            jsonrpc: "2.0",
            id: "0",
            method: "get_snodes_for_pubkey",
            params: json!({ "pubKey": pubkey }),
        };
        let resp = self
            .node_http
            .post(storage_rpc_url(node))
            .json(&payload)
            .send()
            .await
            .map_err(|_| CoreError::Transport("get_snodes_for_pubkey".to_string()))?;
        let parsed: SwarmResponse = self.parse_json(resp).await?;
        Ok(swarm_nodes(parsed.snodes))
    }
}
