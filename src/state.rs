use crate::config::{AppSettings, ConnectionStore};
use crate::error::AppResult;
use crate::sftp::transfer::OpenRegistry;
use crate::ssh::{ConnectionPool, Connector, Ssh2Connector};
use crate::storage::FileStore;
use crate::tunnel::{ForwardStore, TunnelEngine};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Global application state
pub struct AppState {
    pub config_dir: PathBuf,
    pub settings: Arc<RwLock<AppSettings>>,
    pub connections: Arc<RwLock<ConnectionStore>>,
    pub pool: Arc<ConnectionPool>,
    pub tunnels: Arc<TunnelEngine>,
    pub store: Arc<FileStore>,
    pub opened: Arc<OpenRegistry>,
}

impl AppState {
    pub fn new(config_dir: &Path) -> AppResult<Self> {
        let settings = AppSettings::load(config_dir)?;
        let known_hosts = config_dir.join("known_hosts");
        let connector = Arc::new(Ssh2Connector::new(settings.ssh.clone(), Some(known_hosts)));
        Self::with_connector(config_dir, settings, connector)
    }

    /// Build state around any connector. Tests pass an in-memory one.
    pub fn with_connector(
        config_dir: &Path,
        settings: AppSettings,
        connector: Arc<dyn Connector>,
    ) -> AppResult<Self> {
        let connections = ConnectionStore::load(config_dir)?;
        let forwards = ForwardStore::load(config_dir)?;
        let store = FileStore::new(settings.storage_root()?);

        let pool = Arc::new(ConnectionPool::new(connector, settings.ssh.clone()));
        let tunnels = TunnelEngine::new(Arc::clone(&pool), forwards);

        tracing::debug!("Storage root: {}", store.root().display());

        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            settings: Arc::new(RwLock::new(settings)),
            connections: Arc::new(RwLock::new(connections)),
            pool,
            tunnels: Arc::new(tunnels),
            store: Arc::new(store),
            opened: Arc::new(OpenRegistry::new()),
        })
    }

    /// Stop every tunnel, then close every pooled session.
    pub fn shutdown(&self) {
        self.tunnels.stop_all();
        self.pool.release_all();
        tracing::info!("sshdock state shut down");
    }
}
