//! TrapRelay - Main Application Entry Point
//!
//! Wires the trap pipeline, the cluster and the admin server together.

use anyhow::{Context, Result};
use clap::{Arg, Command};
use futures_util::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use traprelay::admin::{self, AdminService};
use traprelay::cluster::{run_heartbeat, ClusterPhase};
use traprelay::credentials::CredentialStore;
use traprelay::directory::{DirectoryHandle, DirectoryPoller, DirectorySource, FileDirectory};
use traprelay::reload::FileReloader;
use traprelay::sender::SenderContext;
use traprelay::{
    tls, AddressPolicy, ClusterState, Config, Converter, HoldQueue, HostRegistry, HttpsPeerClient,
    PeerClient, ProxyRegistry, Router, RuleTables, SnmpListener, TrapFilter, TrapStats,
};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("traprelay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Clustered SNMP trap relay with per-proxy batched delivery")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.json"),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as daemon (suppress console output)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a default configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("generate-simple-config")
                .long("generate-simple-config")
                .help("Generate a single-node configuration with files in the working directory")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let daemon_mode = matches.get_flag("daemon");

    if matches.get_flag("generate-config") {
        return generate_default_config(&config_path, false).await;
    }
    if matches.get_flag("generate-simple-config") {
        return generate_default_config(&config_path, true).await;
    }

    let config = load_configuration(&config_path).await?;

    initialise_logging(&config, daemon_mode)?;

    info!("Starting TrapRelay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", config_path.display());

    config.validate().context("Configuration validation failed")?;

    let _ = rustls::crypto::ring::default_provider().install_default();

    run_application(config).await
}

async fn generate_default_config(config_path: &PathBuf, simple: bool) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Configuration file already exists: {}", config_path.display());
    }

    let config = if simple { Config::simple() } else { Config::default() };
    config
        .save_to_file(config_path)
        .await
        .context("Failed to save default configuration")?;

    println!("Configuration generated: {}", config_path.display());
    println!("Please set cluster.node_name and the rule/credential file paths, then restart.");
    Ok(())
}

async fn load_configuration(config_path: &PathBuf) -> Result<Config> {
    if !config_path.exists() {
        anyhow::bail!(
            "Configuration file not found: {} (use --generate-config to create one)",
            config_path.display()
        );
    }

    Config::load_from_file(config_path)
        .await
        .context("Failed to load configuration file")
}

fn initialise_logging(config: &Config, daemon_mode: bool) -> Result<()> {
    let level = match config.logging.level.as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let mut layers = Vec::new();

    if config.logging.console_output && !daemon_mode {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true);
        layers.push(console_layer.boxed());
    }

    if let Some(ref log_file_path) = config.logging.file_output {
        let log_path = std::path::Path::new(log_file_path);
        let log_dir = log_path.parent().unwrap_or(std::path::Path::new("."));
        let log_filename = log_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("traprelay");

        std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;

        let file_appender = match config.logging.rotation.as_str() {
            "hourly" => tracing_appender::rolling::hourly(log_dir, log_filename),
            _ => tracing_appender::rolling::daily(log_dir, log_filename),
        };
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        layers.push(file_layer.boxed());

        // Dropping the guard stops the background writer.
        static GUARD_HOLDER: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
            std::sync::OnceLock::new();
        let _ = GUARD_HOLDER.set(guard);
    }

    if layers.is_empty() {
        let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        layers.push(stderr_layer.boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .init();

    Ok(())
}

async fn run_application(config: Config) -> Result<()> {
    let capacity = config.pipeline.queue_capacity;

    let stats = Arc::new(TrapStats::new());
    let rules = Arc::new(RuleTables::new());
    let credentials = Arc::new(CredentialStore::new());
    let hosts = Arc::new(HostRegistry::new());
    let cluster = Arc::new(ClusterState::new(&config.cluster.node_name));
    let shutdown = Arc::new(Notify::new());
    let (directory_handle, reread_rx) = DirectoryHandle::channel();

    let reloader = FileReloader::new(
        config.files.reload_paths(),
        Duration::from_secs(config.files.reload_interval_secs),
        rules.clone(),
        credentials.clone(),
        cluster.clone(),
        directory_handle.clone(),
    );
    tokio::spawn(reloader.run());

    let mut signals = Signals::new([SIGTERM, SIGINT]).context("Failed to register signal handlers")?;

    info!(
        path = %config.files.credentials.display(),
        "Waiting for credential material"
    );
    tokio::select! {
        _ = credentials.wait_ready() => {}
        _ = signals.next() => {
            info!("Received shutdown signal before startup completed");
            return Ok(());
        }
    }
    cluster.set_phase(ClusterPhase::Initialized);

    let creds = credentials.snapshot();
    let tls_config = tls::server_config(&creds).context("Failed to load TLS server material")?;
    let http_client = tls::peer_client(&creds, Duration::from_millis(config.cluster.request_timeout_ms))
        .context("Failed to build peer HTTPS client")?;
    let peer_client: Arc<dyn PeerClient> = Arc::new(HttpsPeerClient::new(http_client, creds.service_port));

    let (raw_tx, raw_rx) = mpsc::channel(capacity);
    let (filtered_tx, filtered_rx) = mpsc::channel(capacity);
    let (router_tx, router_rx) = mpsc::channel(capacity);
    let (hold_tx, hold_rx) = mpsc::channel(capacity);

    let listener = SnmpListener::new(config.listener.clone(), raw_tx, stats.clone(), credentials.clone());
    let socket = listener.bind().await?;

    let ctx = SenderContext {
        hosts: hosts.clone(),
        stats: stats.clone(),
        settings: config.sender.settings(),
    };
    let proxies = Arc::new(ProxyRegistry::new(ctx, capacity, config.sender.default_port));

    let filter = TrapFilter::new(
        cluster.clone(),
        AddressPolicy::new(config.allowed_sources.clone()),
        rules.clone(),
        hosts.clone(),
        credentials.clone(),
        stats.clone(),
    );
    tokio::spawn(filter.run(raw_rx, filtered_tx));
    tokio::spawn(Converter::new(rules.clone()).run(filtered_rx, router_tx.clone(), hold_tx));
    tokio::spawn(HoldQueue::new(rules.clone()).run(hold_rx, router_tx, stats.clone()));
    tokio::spawn(Router::new(hosts.clone(), proxies.clone()).run(router_rx));

    let source: Arc<dyn DirectorySource> = Arc::new(FileDirectory::new(config.directory.instances.clone()));
    let poller = DirectoryPoller::new(
        source,
        hosts.clone(),
        proxies.clone(),
        Duration::from_secs(config.directory.poll_interval_secs),
    );
    tokio::spawn(poller.run(reread_rx));

    tokio::spawn(run_heartbeat(
        cluster.clone(),
        peer_client.clone(),
        Duration::from_millis(config.cluster.heartbeat_interval_ms),
    ));

    let admin_ip: IpAddr = config
        .listener
        .bind_address
        .parse()
        .context("Invalid bind address")?;
    let admin_addr = SocketAddr::new(admin_ip, creds.service_port);
    let service = Arc::new(AdminService::new(
        cluster.clone(),
        peer_client,
        hosts,
        proxies,
        stats,
        directory_handle,
        shutdown.clone(),
    ));
    let mut admin_handle = tokio::spawn(admin::serve(service, admin_addr, tls_config));
    let mut listener_handle = tokio::spawn(listener.run(socket));

    info!(
        node = %cluster.name(),
        trap_port = config.listener.port,
        admin = %admin_addr,
        "TrapRelay started successfully"
    );

    tokio::select! {
        _ = signals.next() => {
            info!("Received shutdown signal, stopping");
        }
        _ = shutdown.notified() => {
            info!("Shutdown requested through the admin interface");
        }
        result = &mut admin_handle => {
            match result {
                Ok(Err(e)) => error!("Admin server failed: {:#}", e),
                Ok(Ok(())) => warn!("Admin server stopped unexpectedly"),
                Err(e) => error!("Admin server task panicked: {}", e),
            }
        }
        _ = &mut listener_handle => {
            warn!("SNMP listener stopped unexpectedly");
        }
    }

    // Queued and buffered events are not drained on exit.
    admin_handle.abort();
    listener_handle.abort();
    info!("TrapRelay stopped");
    Ok(())
}
