//! Admin, status and peer endpoints
//!
//! Served over HTTPS with mandatory client certificates on the service port
//! shared by all cluster nodes:
//!
//! | Method | Path | Action |
//! |---|---|---|
//! | GET | `/status` | counters, uptime, mastership, cluster phase, proxies |
//! | GET | `/setmaster` | force this node to become master |
//! | POST | `/healthcheck` | peer heartbeat exchange |
//! | GET | `/rereadb` | immediate directory poll |
//! | PUT | `/proxy/{instance}/{host}/{proxy}` | reassign a host here and on every up peer |
//! | PUT | `/proxyfromcluster/{instance}/{host}/{proxy}` | reassign a host here only |
//! | GET | `/off` | terminate the process |

use crate::cluster::{self, ClusterState, MemberRecord, PeerClient};
use crate::directory::DirectoryHandle;
use crate::error::RegistryError;
use crate::hosts::HostRegistry;
use crate::proxy::ProxyRegistry;
use crate::stats::{NodeView, StatusReport, TrapStats};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

pub struct AdminService {
    cluster: Arc<ClusterState>,
    peers: Arc<dyn PeerClient>,
    hosts: Arc<HostRegistry>,
    proxies: Arc<ProxyRegistry>,
    stats: Arc<TrapStats>,
    directory: DirectoryHandle,
    shutdown: Arc<Notify>,
}

impl AdminService {
    pub fn new(
        cluster: Arc<ClusterState>,
        peers: Arc<dyn PeerClient>,
        hosts: Arc<HostRegistry>,
        proxies: Arc<ProxyRegistry>,
        stats: Arc<TrapStats>,
        directory: DirectoryHandle,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            cluster,
            peers,
            hosts,
            proxies,
            stats,
            directory,
            shutdown,
        }
    }

    pub fn status(&self) -> StatusReport {
        self.stats.report(NodeView {
            master: self.cluster.is_master(),
            phase: self.cluster.phase(),
            proxies: self.proxies.names(),
            unresolved_proxies: self.proxies.unresolved(),
        })
    }

    /// Returns whether this node is master afterwards.
    pub fn set_master(&self) -> bool {
        if self.cluster.is_master() {
            return true;
        }
        self.cluster.force_master()
    }

    pub fn healthcheck(&self, records: Vec<MemberRecord>) -> Vec<MemberRecord> {
        self.cluster.handle_heartbeat(records)
    }

    pub fn reread(&self) -> bool {
        self.directory.request_reread()
    }

    pub async fn reassign_local(&self, instance: &str, host: &str, proxy: &str) -> Result<(), RegistryError> {
        self.hosts.reassign(host, instance, proxy)?;
        self.proxies.ensure(proxy).await;
        Ok(())
    }

    /// Reassign locally, then on every peer that is up; returns how many peers applied it.
    pub async fn reassign(&self, instance: &str, host: &str, proxy: &str) -> Result<usize, RegistryError> {
        self.reassign_local(instance, host, proxy).await?;
        Ok(cluster::propagate_reassign(&self.cluster, self.peers.as_ref(), instance, host, proxy).await)
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

type Shared = Arc<AdminService>;

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = match self {
            RegistryError::HostNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

async fn status_handler(State(service): State<Shared>) -> Json<StatusReport> {
    Json(service.status())
}

async fn set_master_handler(
    State(service): State<Shared>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> StatusCode {
    let was_master = service.cluster.is_master();
    service.set_master();
    if was_master {
        info!(%remote, "Set-master command received, already master");
    } else {
        info!(%remote, "Mastership forced by admin command");
    }
    StatusCode::ACCEPTED
}

async fn healthcheck_handler(State(service): State<Shared>, body: Bytes) -> Json<Vec<MemberRecord>> {
    let records = match serde_json::from_slice::<Vec<MemberRecord>>(&body) {
        Ok(records) => records,
        Err(e) => {
            warn!("Unreadable heartbeat body: {}", e);
            Vec::new()
        }
    };
    Json(service.healthcheck(records))
}

async fn reread_handler(
    State(service): State<Shared>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> StatusCode {
    info!(%remote, "Directory reread requested by admin command");
    if service.reread() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn reassign_handler(
    State(service): State<Shared>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((instance, host, proxy)): Path<(String, String, String)>,
) -> Result<StatusCode, RegistryError> {
    let peers = service.reassign(&instance, &host, &proxy).await?;
    info!(%remote, host = %host, proxy = %proxy, instance = %instance, peers, "Host reassigned by admin command");
    Ok(StatusCode::CREATED)
}

async fn reassign_local_handler(
    State(service): State<Shared>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((instance, host, proxy)): Path<(String, String, String)>,
) -> Result<StatusCode, RegistryError> {
    service.reassign_local(&instance, &host, &proxy).await?;
    info!(%remote, host = %host, proxy = %proxy, instance = %instance, "Host reassigned by cluster peer");
    Ok(StatusCode::CREATED)
}

async fn off_handler(
    State(service): State<Shared>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> StatusCode {
    warn!(%remote, "Shutdown requested by admin command");
    service.shutdown();
    StatusCode::OK
}

pub fn router(service: Shared) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/setmaster", get(set_master_handler))
        .route("/healthcheck", post(healthcheck_handler))
        .route("/rereadb", get(reread_handler))
        .route("/proxy/{instance}/{host}/{proxy}", put(reassign_handler))
        .route("/proxyfromcluster/{instance}/{host}/{proxy}", put(reassign_local_handler))
        .route("/off", get(off_handler))
        .with_state(service)
}

pub async fn serve(service: Shared, addr: SocketAddr, tls: ServerConfig) -> Result<()> {
    let config = RustlsConfig::from_config(Arc::new(tls));
    info!(%addr, "Admin server listening (mTLS)");

    axum_server::bind_rustls(addr, config)
        .serve(router(service).into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("Admin server failed")
}
