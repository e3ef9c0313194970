mod clients;
mod config;

use bytes::Bytes;
use clients::local::{LocalCommunityJoiner, LoggingAvatarFetcher, UnroutedMessageQueue};
use clients::snode_http::SnodeHttpClient;
use config::DaemonConfig;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::LevelFilter;
use snodesync_core::group_crypto::X25519KeyWrapper;
use snodesync_core::store::{ConversationStore, InMemoryConversations, InMemoryKeyPairs, JsonFileItemStore};
use snodesync_core::wrapper::LwwConfigWrappers;
use snodesync_core::{Core, CoreDeps};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config")]
    Config,
    #[error("core")]
    Core,
    #[error("bind")]
    Bind,
}

#[derive(Clone)]
struct DaemonState {
    core: Core,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("snodesync.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path).map_err(|_| DaemonError::Config)?;
    init_logging(&cfg);
    if let Err(e) = cfg.validate() {
        log::error!("config {} rejected: {}", path.display(), e);
        return Err(DaemonError::Config);
    }
    let core = init_core(&cfg).await?;
    let state = DaemonState { core };

    let (server_tx, server_rx) = oneshot::channel();
    let (addr, server) = start_control_server(state.clone(), &cfg.api.bind_addr, server_rx).await?;
    log::info!("control api listening on {}", addr);
    let (refresh_tx, refresh_rx) = oneshot::channel();
    let refresher = spawn_refresh_loop(
        state.core.clone(),
        Duration::from_secs(cfg.refresh.interval_secs),
        refresh_rx,
    );

    let _ = signal::ctrl_c().await;
    log::info!("shutting down");
    let _ = refresh_tx.send(());
    let _ = server_tx.send(());
    let _ = refresher.await;
    let _ = server.await;
    state.core.shutdown().await;
    Ok(())
}

fn init_logging(cfg: &DaemonConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

async fn init_core(cfg: &DaemonConfig) -> Result<Core, DaemonError> {
    let account = cfg.account_key().map_err(|_| DaemonError::Config)?;
    let items = JsonFileItemStore::open_or_create(&cfg.data_dir, account.as_str())
        .map_err(|_| DaemonError::Core)?;
    let rpc = SnodeHttpClient::new().map_err(|_| DaemonError::Core)?;
    let conversations: Arc<dyn ConversationStore> = Arc::new(InMemoryConversations::new());
    let deps = CoreDeps {
        rpc: Arc::new(rpc),
        items: Arc::new(items),
        conversations: conversations.clone(),
        key_pairs: Arc::new(InMemoryKeyPairs::new()),
        wrappers: Arc::new(LwwConfigWrappers::new()),
        queue: Arc::new(UnroutedMessageQueue),
        crypto: Arc::new(X25519KeyWrapper::new()),
        avatars: Arc::new(LoggingAvatarFetcher),
        joiner: Arc::new(LocalCommunityJoiner::new(conversations)),
    };
    Core::init(cfg.core_config(), account, deps)
        .await
        .map_err(|e| {
            log::error!("core init failed: {}", e);
            DaemonError::Core
        })
}

/// Periodically refreshes our own swarm so polling always has targets.
fn spawn_refresh_loop(
    core: Core,
    period: Duration,
    shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                _ = ticker.tick() => {
                    refresh_once(&core).await;
                }
            }
        }
    })
}

async fn refresh_once(core: &Core) {
    match core.swarm().our_swarm().await {
        Ok(nodes) => log::info!("our swarm has {} nodes", nodes.len()),
        Err(e) => log::warn!("refreshing our swarm failed: {}", e),
    }
    if core.scheduler().is_pending().await {
        log::debug!("config push job waiting for a push route");
    }
}

async fn start_control_server(
    state: DaemonState,
    bind_addr: &str,
    shutdown: oneshot::Receiver<()>,
) -> Result<(SocketAddr, JoinHandle<()>), DaemonError> {
    let addr: SocketAddr = bind_addr.parse().map_err(|_| DaemonError::Config)?;
    let listener = TcpListener::bind(addr).await.map_err(|_| DaemonError::Bind)?;
    let local = listener.local_addr().map_err(|_| DaemonError::Bind)?;
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let state = state.clone();
                                    async move { handle_request(state, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, service).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    });
    Ok((local, handle))
}

async fn status_body(core: &Core) -> serde_json::Value {
    let our_swarm: Vec<String> = core
        .swarm()
        .cached_our_swarm()
        .await
        .into_iter()
        .map(|n| n.node.to_string())
        .collect();
    serde_json::json!({
        "account": core.our_key().as_str(),
        "sync_mode": format!("{:?}", core.config().sync_mode),
        "pool_size": core.swarm().pool_len().await,
        "our_swarm": our_swarm,
        "polled": core.subscriptions().polled().await,
        "push_pending": core.scheduler().is_pending().await,
    })
}

async fn handle_request(
    state: DaemonState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method().as_str(), req.uri().path()) {
        ("GET", "/health") => Ok(Response::new(Full::from(
            serde_json::json!({"status":"ok"}).to_string(),
        ))),
        ("GET", "/status") => {
            let body = status_body(&state.core).await;
            Ok(Response::new(Full::from(body.to_string())))
        }
        _ => {
            let mut resp = Response::new(Full::from(Bytes::from_static(b"not found")));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}

#[cfg(test)]
mod tests;
