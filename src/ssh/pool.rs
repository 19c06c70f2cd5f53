use crate::config::{SshConfig, SshSettings};
use crate::error::{AppError, AppResult};
use crate::logging::{self, LogLevel, LogSubsystem};
use crate::ssh::endpoint::EndpointKey;
use crate::ssh::transport::{Connector, FileChannel, Transport};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// A reusable authenticated transport plus its lazily opened file channel
pub struct PooledSession {
    id: u64,
    key: EndpointKey,
    transport: Arc<dyn Transport>,
    files: OnceCell<Arc<dyn FileChannel>>,
    created_at: i64,
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl PooledSession {
    fn new(id: u64, key: EndpointKey, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            key,
            transport,
            files: OnceCell::new(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn has_file_channel(&self) -> bool {
        self.files.initialized()
    }

    /// The SFTP channel, opened on first use and cached for the session's lifetime.
    pub async fn file_channel(&self) -> AppResult<Arc<dyn FileChannel>> {
        let files = self
            .files
            .get_or_try_init(|| self.transport.open_file_channel())
            .await?;
        Ok(Arc::clone(files))
    }
}

/// One live session per endpoint, validated before every reuse.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    settings: SshSettings,
    sessions: Arc<DashMap<EndpointKey, Arc<PooledSession>>>,
    acquire_locks: DashMap<EndpointKey, Arc<Mutex<()>>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, settings: SshSettings) -> Self {
        Self {
            connector,
            settings,
            sessions: Arc::new(DashMap::new()),
            acquire_locks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Hand out a live session for `config`'s endpoint, creating or replacing it as needed.
    pub async fn acquire(
        &self,
        config: &SshConfig,
        needs_file_channel: bool,
    ) -> AppResult<Arc<PooledSession>> {
        let key = config.endpoint_key()?;

        // Concurrent acquires for the same endpoint wait for the first one
        let lock = self
            .acquire_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        let pooled = self.sessions.get(&key).map(|s| Arc::clone(s.value()));
        match pooled {
            Some(session) => match self.probe(&session).await {
                Ok(()) => {
                    if needs_file_channel {
                        session.file_channel().await?;
                    }
                    tracing::debug!("Reusing pooled session {} for {}", session.id, key);
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!("Pooled session for {} failed its probe: {}", key, e);
                    self.evict(&session);
                    logging::log(LogLevel::Info, LogSubsystem::Pool, "Re-establishing connection...");
                }
            },
            None => {
                logging::log(LogLevel::Info, LogSubsystem::Pool, "Establishing connection...");
            }
        }

        match self.establish(config, key.clone(), needs_file_channel).await {
            Ok(session) => Ok(session),
            Err(e) => {
                logging::report(LogSubsystem::Pool, &format!("Connection to {} failed", key), &e);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        config: &SshConfig,
        key: EndpointKey,
        needs_file_channel: bool,
    ) -> AppResult<Arc<PooledSession>> {
        let mut config = config.clone();
        config.load_private_key()?;

        let transport = tokio::time::timeout(
            self.settings.connect_timeout(),
            self.connector.connect(&config),
        )
        .await
        .map_err(|_| AppError::Timeout(format!("Timed out connecting to {}", key)))??;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(PooledSession::new(id, key.clone(), transport));

        if needs_file_channel {
            if let Err(e) = session.file_channel().await {
                session.transport.close();
                return Err(e);
            }
        }

        self.sessions.insert(key.clone(), Arc::clone(&session));
        self.watch_end(&session);

        tracing::info!("Pooled new session {} for {}", id, key);
        Ok(session)
    }

    /// Run the liveness command with the probe timeout.
    async fn probe(&self, session: &PooledSession) -> AppResult<()> {
        if *session.transport.end_signal().borrow() {
            return Err(AppError::Connection("Session already ended".to_string()));
        }
        tokio::time::timeout(
            self.settings.probe_timeout(),
            session.transport.exec(&self.settings.probe_command),
        )
        .await
        .map_err(|_| AppError::Timeout(format!("Liveness probe for {} timed out", session.key)))??;
        Ok(())
    }

    /// Remove the session's entry if it is still the pooled one, and end its transport.
    fn evict(&self, session: &Arc<PooledSession>) {
        let id = session.id;
        self.sessions.remove_if(&session.key, |_, pooled| pooled.id == id);
        session.transport.close();
    }

    /// Drop the pool entry when the transport reports it has ended.
    fn watch_end(&self, session: &Arc<PooledSession>) {
        let sessions = Arc::clone(&self.sessions);
        let key = session.key.clone();
        let id = session.id;
        let mut end = session.transport.end_signal();

        tokio::spawn(async move {
            while !*end.borrow_and_update() {
                if end.changed().await.is_err() {
                    break;
                }
            }
            if sessions.remove_if(&key, |_, pooled| pooled.id == id).is_some() {
                tracing::info!("Session {} for {} ended, removed from pool", id, key);
            }
        });
    }

    /// Evict one endpoint's session.
    pub fn release(&self, key: &EndpointKey) -> bool {
        match self.sessions.remove(key) {
            Some((_, session)) => {
                session.transport.close();
                true
            }
            None => false,
        }
    }

    /// End every pooled transport and empty the pool.
    pub fn release_all(&self) {
        let keys: Vec<EndpointKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.release(&key);
        }
        tracing::info!("Released all pooled sessions");
    }

    pub fn contains(&self, key: &EndpointKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn get(&self, key: &EndpointKey) -> Option<Arc<PooledSession>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    pub fn keys(&self) -> Vec<EndpointKey> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
