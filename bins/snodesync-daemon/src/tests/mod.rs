use super::*;
use crate::config::{
    ApiConfig, IdentityConfig, LoggingConfig, RefreshConfig, SeedConfig, SyncConfig,
    SyncModeSetting,
};
use http_body_util::BodyExt;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use snodesync_core::config::SyncMode;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::duplex;

mod config_validation_tests;

const ACCOUNT: &str = "051111111111111111111111111111111111111111111111111111111111111111";

#[tokio::test]
async fn config_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("conf.toml");
    let cfg = format!(
        r#"
data_dir = "{dir}"

[identity]
account_key = "{account}"

[seed]
url = "https://seed.test"
port = 4433
limit = 12

[sync]
mode = "shared_config"
registration_done = true

[logging]
level = "info"
"#,
        dir = dir.path().display(),
        account = ACCOUNT
    );
    std::fs::write(&path, cfg).unwrap();
    let loaded = config::load_config(&path).unwrap();
    loaded.validate().unwrap();
    assert_eq!(loaded.identity.account_key, ACCOUNT);
    assert_eq!(loaded.refresh.interval_secs, 60);
    assert_eq!(loaded.api.bind_addr, "127.0.0.1:9180");

    let core_cfg = loaded.core_config();
    assert_eq!(core_cfg.seed_node_url, "https://seed.test");
    assert_eq!(core_cfg.seed_node_port, 4433);
    assert_eq!(core_cfg.seed_node_limit, 12);
    assert_eq!(core_cfg.minimum_swarm_nodes, 1);
    assert_eq!(core_cfg.sync_mode, SyncMode::SharedConfig);
    assert!(core_cfg.registration_done);
}

#[tokio::test]
async fn missing_file_and_bad_toml_are_reported() {
    let dir = tempdir().unwrap();
    let missing = config::load_config(&dir.path().join("absent.toml"));
    assert!(matches!(missing, Err(config::ConfigError::Io)));
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "data_dir = [").unwrap();
    assert!(matches!(
        config::load_config(&path),
        Err(config::ConfigError::Parse)
    ));
}

#[tokio::test]
async fn daemon_starts_and_stops() {
    let cfg = test_config();
    let state = build_state(&cfg).await;
    let (tx, rx) = oneshot::channel();
    let (addr, handle) = start_control_server(state.clone(), &cfg.api.bind_addr, rx)
        .await
        .unwrap();
    assert!(addr.port() > 0);
    let _ = tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn control_endpoints() {
    let cfg = test_config();
    let state = build_state(&cfg).await;

    let health = send_in_memory_request(state.clone(), build_request("/health")).await;
    assert_eq!(health.status(), StatusCode::OK);

    let status = send_in_memory_request(state.clone(), build_request("/status")).await;
    assert_eq!(status.status(), StatusCode::OK);
    let body = status.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["account"], ACCOUNT);
    assert_eq!(json["pool_size"], 0);
    assert_eq!(json["polled"], serde_json::json!([ACCOUNT]));
    assert_eq!(json["push_pending"], false);

    let missing = send_in_memory_request(state, build_request("/nope")).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

pub(super) fn test_config() -> DaemonConfig {
    #[allow(deprecated)]
    DaemonConfig {
        data_dir: tempdir().unwrap().into_path(),
        identity: IdentityConfig {
            account_key: ACCOUNT.to_string(),
        },
        seed: SeedConfig {
            url: "https://seed.test".to_string(),
            port: 4433,
            limit: 20,
            minimum_swarm_nodes: 1,
        },
        sync: SyncConfig {
            mode: SyncModeSetting::Both,
            registration_done: false,
        },
        refresh: RefreshConfig { interval_secs: 60 },
        api: ApiConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        },
        logging: LoggingConfig {
            level: "error".to_string(),
        },
    }
}

pub(super) async fn build_state(cfg: &DaemonConfig) -> DaemonState {
    init_logging(cfg);
    let core = init_core(cfg).await.unwrap();
    DaemonState { core }
}

fn build_request(path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("host", "localhost")
        .body(Full::from(Bytes::new()))
        .unwrap()
}

async fn send_in_memory_request(state: DaemonState, req: Request<Full<Bytes>>) -> Response<Incoming> {
    let (client, server) = duplex(4096);
    let service = service_fn(move |incoming: Request<Incoming>| {
        let inner = state.clone();
        async move { handle_request(inner, incoming).await }
    });
    let server_task = tokio::spawn(async move {
        let io = TokioIo::new(server);
        let _ = server_http1::Builder::new().serve_connection(io, service).await;
    });
    let io = TokioIo::new(client);
    let (mut sender, connection) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    let response = sender.send_request(req).await.unwrap();
    drop(sender);
    let _ = server_task.await;
    response
}
