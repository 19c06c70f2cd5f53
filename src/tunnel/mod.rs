//! Local port forwards over pooled SSH sessions.
//!
//! Each active forward owns a local listener. Every accepted connection gets its
//! own forwarded channel through the endpoint's pooled transport.

pub mod bridge;
pub mod store;

pub use store::ForwardStore;

use crate::config::SshConfig;
use crate::error::{AppError, AppResult};
use crate::logging::{self, LogLevel, LogSubsystem};
use crate::ssh::ConnectionPool;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

/// One persisted local-to-remote forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    /// Whether a listener is currently open. Never stored.
    #[serde(skip)]
    pub active: bool,
}

impl ForwardDescriptor {
    pub fn new(
        host: &str,
        port: u16,
        name: impl Into<String>,
        local_host: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        let mut descriptor = Self {
            id: String::new(),
            name: name.into(),
            local_host: local_host.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            active: false,
        };
        descriptor.id = descriptor.derive_id(host, port);
        descriptor
    }

    /// Forward declared against `config`'s endpoint
    pub fn for_config(
        config: &SshConfig,
        name: impl Into<String>,
        local_host: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self::new(
            &config.host,
            config.port,
            name,
            local_host,
            local_port,
            remote_host,
            remote_port,
        )
    }

    fn derive_id(&self, host: &str, port: u16) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}",
            host, port, self.local_host, self.local_port, self.remote_host, self.remote_port
        )
    }

    pub fn local_bind(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn remote_target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardState {
    Defined,
    Starting,
    Active,
    Stopped,
    Failed,
}

impl std::fmt::Display for ForwardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ForwardState::Defined => "defined",
            ForwardState::Starting => "starting",
            ForwardState::Active => "active",
            ForwardState::Stopped => "stopped",
            ForwardState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TunnelEvent {
    Started { id: String, local_addr: SocketAddr },
    ConnectionOpened { id: String, peer: SocketAddr },
    ConnectionClosed { id: String, peer: SocketAddr },
    Failed { id: String, error: String, user_visible: bool },
    Stopped { id: String },
}

struct ActiveTunnel {
    generation: u64,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveTunnel {
    fn close(self) {
        self.shutdown.send_replace(true);
        self.task.abort();
    }
}

/// State the engine shares with its listener and connection tasks
struct Shared {
    active: DashMap<String, ActiveTunnel>,
    states: DashMap<String, ForwardState>,
    events: broadcast::Sender<TunnelEvent>,
}

impl Shared {
    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, id: &str, state: ForwardState) {
        self.states.insert(id.to_string(), state);
    }

    /// Record a pending or failed start unless another start of `id` is live.
    /// Holding the state entry orders this against `activate`, which inserts
    /// into `active` before writing `Active`.
    fn set_state_unless_active(&self, id: &str, state: ForwardState) {
        let entry = self.states.entry(id.to_string());
        if !self.active.contains_key(id) {
            entry.insert(state);
        }
    }

    /// Tear down the listener generation that hit `err`, if it is still the active one.
    fn fail(&self, id: &str, generation: u64, err: &AppError) {
        logging::report(LogSubsystem::Tunnel, &format!("Forward {} failed", id), err);
        if let Some((_, tunnel)) = self.active.remove_if(id, |_, t| t.generation == generation) {
            tunnel.close();
            self.set_state(id, ForwardState::Failed);
            self.emit(TunnelEvent::Failed {
                id: id.to_string(),
                error: err.to_string(),
                user_visible: err.is_user_visible(),
            });
        }
    }
}

struct TunnelContext {
    id: String,
    generation: u64,
    config: SshConfig,
    remote_host: String,
    remote_port: u16,
    pool: Arc<ConnectionPool>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

/// Starts, stops and tracks local forwards
pub struct TunnelEngine {
    pool: Arc<ConnectionPool>,
    store: Mutex<ForwardStore>,
    shared: Arc<Shared>,
    next_generation: AtomicU64,
}

impl TunnelEngine {
    pub fn new(pool: Arc<ConnectionPool>, store: ForwardStore) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pool,
            store: Mutex::new(store),
            shared: Arc::new(Shared {
                active: DashMap::new(),
                states: DashMap::new(),
                events,
            }),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Open a listener for `descriptor`. With `create`, the forward is also
    /// persisted and an identical existing declaration is rejected.
    pub async fn create(
        &self,
        config: &SshConfig,
        descriptor: ForwardDescriptor,
        create: bool,
    ) -> AppResult<ForwardDescriptor> {
        let mut descriptor = descriptor;
        descriptor.id = descriptor.derive_id(&config.host, config.port);
        let key = config.forward_store_key();
        let id = descriptor.id.clone();

        let declared = create && self.store.lock().contains(&key, &id);
        if declared {
            let err = AppError::DuplicateForward(id);
            logging::report(LogSubsystem::Tunnel, "Cannot add forward", &err);
            return Err(err);
        }
        if self.shared.active.contains_key(&id) {
            tracing::debug!("Forward {} is already active", id);
            descriptor.active = true;
            return Ok(descriptor);
        }

        self.shared.set_state_unless_active(&id, ForwardState::Starting);
        let listener = match self.bind(config, &descriptor).await {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.set_state_unless_active(&id, ForwardState::Failed);
                logging::report(LogSubsystem::Tunnel, &format!("Forward {} failed to start", id), &e);
                return Err(e);
            }
        };

        if create {
            let persisted = self.store.lock().add(&key, descriptor.clone());
            if let Err(e) = persisted {
                self.shared.set_state_unless_active(&id, ForwardState::Failed);
                return Err(e);
            }
        }

        let local_addr = self.activate(config, &descriptor, listener)?;
        logging::log_endpoint(
            LogLevel::Info,
            LogSubsystem::Tunnel,
            config.connection_id(),
            format!("Forwarding {} -> {}", local_addr, descriptor.remote_target()),
        );
        descriptor.active = true;
        Ok(descriptor)
    }

    /// Re-open the listener for a persisted forward.
    pub async fn start(&self, config: &SshConfig, id: &str) -> AppResult<ForwardDescriptor> {
        let descriptor = self
            .store
            .lock()
            .find(&config.forward_store_key(), id)
            .ok_or_else(|| AppError::ForwardNotFound(id.to_string()))?;
        self.create(config, descriptor, false).await
    }

    /// Start every persisted forward of `config`'s endpoint that is not already running.
    pub async fn start_all(&self, config: &SshConfig) -> Vec<(String, AppResult<SocketAddr>)> {
        let descriptors = self.store.lock().list(&config.forward_store_key());
        let mut outcomes = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let id = descriptor.id.clone();
            let outcome = match self.create(config, descriptor, false).await {
                Ok(_) => self
                    .local_addr(&id)
                    .ok_or_else(|| AppError::Tunnel(format!("Forward {} stopped while starting", id))),
                Err(e) => Err(e),
            };
            outcomes.push((id, outcome));
        }
        outcomes
    }

    /// Close the listener and its connections. The persisted forward stays.
    pub fn stop(&self, id: &str) -> AppResult<()> {
        let (_, tunnel) = self
            .shared
            .active
            .remove(id)
            .ok_or_else(|| AppError::ForwardNotFound(id.to_string()))?;
        tunnel.close();
        self.shared.set_state(id, ForwardState::Stopped);
        self.shared.emit(TunnelEvent::Stopped { id: id.to_string() });
        logging::log(LogLevel::Info, LogSubsystem::Tunnel, format!("Stopped forward {}", id));
        Ok(())
    }

    pub fn close_tunnel(&self, id: &str) -> AppResult<()> {
        self.stop(id)
    }

    pub fn stop_all(&self) {
        for id in self.active_ids() {
            let _ = self.stop(&id);
        }
    }

    /// Stop the forward if needed and delete its persisted declaration.
    pub fn remove(&self, config: &SshConfig, id: &str) -> AppResult<ForwardDescriptor> {
        if self.shared.active.contains_key(id) {
            self.stop(id)?;
        }
        let removed = self.store.lock().remove(&config.forward_store_key(), id)?;
        self.shared.states.remove(id);
        Ok(removed)
    }

    /// Persisted forwards for `config`'s endpoint, with `active` from live state
    pub fn list(&self, config: &SshConfig) -> Vec<ForwardDescriptor> {
        self.store
            .lock()
            .list(&config.forward_store_key())
            .into_iter()
            .map(|mut f| {
                f.active = self.shared.active.contains_key(&f.id);
                f
            })
            .collect()
    }

    pub fn state(&self, id: &str) -> ForwardState {
        self.shared
            .states
            .get(id)
            .map(|s| *s.value())
            .unwrap_or(ForwardState::Defined)
    }

    /// Address the listener actually bound, while active
    pub fn local_addr(&self, id: &str) -> Option<SocketAddr> {
        self.shared.active.get(id).map(|t| t.local_addr)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.shared.active.iter().map(|e| e.key().clone()).collect()
    }

    async fn bind(&self, config: &SshConfig, descriptor: &ForwardDescriptor) -> AppResult<TcpListener> {
        self.pool.acquire(config, false).await?;
        TcpListener::bind((descriptor.local_host.as_str(), descriptor.local_port))
            .await
            .map_err(|e| AppError::Tunnel(format!("Failed to bind {}: {}", descriptor.local_bind(), e)))
    }

    fn activate(
        &self,
        config: &SshConfig,
        descriptor: &ForwardDescriptor,
        listener: TcpListener,
    ) -> AppResult<SocketAddr> {
        let local_addr = listener.local_addr()?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let ctx = Arc::new(TunnelContext {
            id: descriptor.id.clone(),
            generation,
            config: config.clone(),
            remote_host: descriptor.remote_host.clone(),
            remote_port: descriptor.remote_port,
            pool: Arc::clone(&self.pool),
            shared: Arc::clone(&self.shared),
            shutdown: shutdown_rx,
        });
        let task = tokio::spawn(accept_loop(ctx, listener, ready_rx));

        let tunnel = ActiveTunnel {
            generation,
            local_addr,
            shutdown: shutdown_tx,
            task,
        };
        if let Some(previous) = self.shared.active.insert(descriptor.id.clone(), tunnel) {
            previous.close();
        }
        // Accepting starts only once the entry is visible to failure handling
        let _ = ready_tx.send(());

        self.shared.set_state(&descriptor.id, ForwardState::Active);
        self.shared.emit(TunnelEvent::Started {
            id: descriptor.id.clone(),
            local_addr,
        });
        Ok(local_addr)
    }
}

impl Drop for TunnelEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn accept_loop(ctx: Arc<TunnelContext>, listener: TcpListener, ready: oneshot::Receiver<()>) {
    if ready.await.is_err() {
        return;
    }
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            _ = bridge::wait_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("[{}] Accepted connection from {}", ctx.id, peer);
                    tokio::spawn(serve_connection(Arc::clone(&ctx), stream, peer));
                }
                Err(e) => tracing::warn!("[{}] Accept failed: {}", ctx.id, e),
            }
        }
    }
    tracing::debug!("[{}] Listener closed", ctx.id);
}

async fn serve_connection(ctx: Arc<TunnelContext>, stream: TcpStream, peer: SocketAddr) {
    ctx.shared.emit(TunnelEvent::ConnectionOpened {
        id: ctx.id.clone(),
        peer,
    });

    let result: AppResult<()> = async {
        let session = ctx.pool.acquire(&ctx.config, false).await?;
        let channel = session
            .transport()
            .forward_out(&ctx.remote_host, ctx.remote_port)
            .await?;
        bridge::run(stream, channel, ctx.shutdown.clone()).await
    }
    .await;

    match result {
        Ok(()) => ctx.shared.emit(TunnelEvent::ConnectionClosed {
            id: ctx.id.clone(),
            peer,
        }),
        Err(e) => ctx.shared.fail(&ctx.id, ctx.generation, &e),
    }
}
