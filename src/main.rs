use pagegate::api::{ApiServer, ManagementApi, PKG_NAME, VERSION};
use pagegate::auth::{AuthConfig, AuthManager};
use pagegate::clock::{Clock, SystemClock};
use pagegate::config::{Config, StorageBackend};
use pagegate::content::StorageContent;
use pagegate::db::Database;
use pagegate::dispatcher::RequestDispatcher;
use pagegate::domains::DbDomainLookup;
use pagegate::host::{HostPattern, HostResolver};
use pagegate::lifecycle::DeploymentLifecycle;
use pagegate::resolver::ResolutionCache;
use pagegate::server::SiteServer;
use pagegate::site::DbSiteResolver;
use pagegate::storage::{FilesystemStorage, MemoryStorage, ObjectStorage};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pagegate=info")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("pagegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let db = open_database(&config.database.path)?;
    let storage = open_storage(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Serving stack: host -> site identifier -> descriptor -> content
    let pattern = HostPattern::new(&config.sites.host_pattern)?;
    let scheme = config.sites.host_id_scheme;
    let domains = Arc::new(DbDomainLookup::new(db.clone(), scheme));
    let hosts = Arc::new(HostResolver::new(
        pattern.clone(),
        config.sites.default_site.clone(),
        domains,
    ));
    let sites = Arc::new(DbSiteResolver::new(db.clone(), scheme));
    let cache = Arc::new(ResolutionCache::new(
        hosts,
        sites,
        config.sites.cache_capacity,
        config.sites.cache_ttl(),
    )?);
    let content = Arc::new(StorageContent::new(Arc::clone(&storage)));
    let dispatcher = Arc::new(RequestDispatcher::new(cache, content));

    // Management stack
    let lifecycle = Arc::new(DeploymentLifecycle::new(
        db,
        storage,
        clock,
        config.deployments.clone(),
        config.storage.key_prefix.clone(),
    ));
    let auth = AuthManager::new(AuthConfig::from_settings(&config.auth));
    if config.server.admin_token.is_none() {
        warn!("No admin_token configured; only user tokens are accepted by the API");
    }
    let api = Arc::new(ManagementApi::new(
        lifecycle,
        auth,
        config.server.admin_token.clone(),
        pattern,
        scheme,
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let site_addr = bind_addr(&config.server.bind, config.server.port)?;
    let api_addr = bind_addr(&config.server.bind, config.server.api_port)?;

    let site_server = SiteServer::new(site_addr, dispatcher, shutdown_rx.clone());
    let site_handle = tokio::spawn(async move {
        if let Err(e) = site_server.run().await {
            error!(error = %e, "Site server error");
        }
    });

    let api_server = ApiServer::new(api_addr, api, shutdown_rx);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "Management API server error");
        }
    });

    wait_for_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let timeout = config.server.shutdown_timeout();
    if tokio::time::timeout(timeout, async {
        let _ = site_handle.await;
        let _ = api_handle.await;
    })
    .await
    .is_err()
    {
        warn!(timeout_secs = timeout.as_secs(), "Servers did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind = %bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

fn open_database(path: &str) -> anyhow::Result<Database> {
    if path == ":memory:" {
        warn!("Using in-memory database; all state is lost on exit");
        return Database::open_in_memory();
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e))?;
    }
    let db = Database::open(path)?;
    info!(path = %path, "Database opened");
    Ok(db)
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<dyn ObjectStorage>> {
    match config.storage.backend {
        StorageBackend::Filesystem => {
            let storage = FilesystemStorage::new(&config.storage.root).map_err(|e| {
                anyhow::anyhow!("Failed to open storage root '{}': {}", config.storage.root, e)
            })?;
            info!(root = %config.storage.root, "Filesystem object storage ready");
            Ok(Arc::new(storage))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory object storage; deployments are lost on exit");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting static site server");

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        api_port = config.server.api_port,
        shutdown_timeout_secs = config.server.shutdown_timeout_secs,
        "Server configuration"
    );
    info!(
        host_pattern = %config.sites.host_pattern,
        host_id_scheme = ?config.sites.host_id_scheme,
        default_site = %config.sites.default_site,
        cache_capacity = config.sites.cache_capacity,
        cache_ttl_ms = config.sites.cache_ttl_ms,
        "Site resolution settings"
    );
    info!(
        max_files = config.deployments.max_files,
        max_size_bytes = config.deployments.max_size_bytes,
        "Deployment limits"
    );
}
