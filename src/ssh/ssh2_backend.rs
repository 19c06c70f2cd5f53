//! libssh2 implementation of the transport seam.
//!
//! The session is authenticated in blocking mode and then switched to
//! non-blocking, so a forwarded channel waiting for data never holds the
//! session lock. Every libssh2 call goes through [`retry`], which spins on
//! EAGAIN until the operation deadline.

use crate::config::{SshConfig, SshSettings};
use crate::error::{AppError, AppResult};
use crate::ssh::transport::{
    Connector, FileChannel, FileKind, ForwardChannel, RemoteStat, Transport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use ssh2::{
    CheckResult, ErrorCode, FileStat, KnownHostFileKind, KnownHostKeyFormat, MethodType, Session, Sftp,
};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// libssh2 EAGAIN
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Run a libssh2 call until it stops returning EAGAIN or the deadline passes.
fn retry<T>(
    timeout: Duration,
    what: &str,
    map_err: fn(&str, ssh2::Error) -> AppError,
    mut op: impl FnMut() -> Result<T, ssh2::Error>,
) -> AppResult<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if would_block(&e) => {
                if Instant::now() >= deadline {
                    return Err(AppError::Timeout(format!("{} timed out", what)));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(map_err(what, e)),
        }
    }
}

fn transport_err(what: &str, e: ssh2::Error) -> AppError {
    AppError::transport(what, e)
}

fn protocol_err(what: &str, e: ssh2::Error) -> AppError {
    AppError::protocol(what, e)
}

/// Blocking `Read`/`Write` over a non-blocking libssh2 stream.
struct BlockingIo<T> {
    inner: T,
    idle_timeout: Duration,
}

impl<T> BlockingIo<T> {
    fn wait<R>(&mut self, mut op: impl FnMut(&mut T) -> io::Result<R>) -> io::Result<R> {
        let deadline = Instant::now() + self.idle_timeout;
        loop {
            match op(&mut self.inner) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "remote stream stalled"));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

impl<T: Read> Read for BlockingIo<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.wait(|inner| inner.read(buf))
    }
}

impl<T: Write> Write for BlockingIo<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wait(|inner| inner.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.wait(|inner| inner.flush())
    }
}

/// Opens libssh2 sessions
pub struct Ssh2Connector {
    settings: SshSettings,
    known_hosts_path: Option<PathBuf>,
}

impl Ssh2Connector {
    pub fn new(settings: SshSettings, known_hosts_path: Option<PathBuf>) -> Self {
        Self {
            settings,
            known_hosts_path,
        }
    }
}

#[async_trait]
impl Connector for Ssh2Connector {
    async fn connect(&self, config: &SshConfig) -> AppResult<Arc<dyn Transport>> {
        let config = config.clone();
        let settings = self.settings.clone();
        let known_hosts = self.known_hosts_path.clone();

        let session =
            tokio::task::spawn_blocking(move || connect_blocking(&config, &settings, known_hosts.as_deref()))
                .await??;

        let (label, session, op_timeout, keepalive) = session;
        let (end_tx, _) = watch::channel(false);
        let transport = Arc::new(Ssh2Transport {
            label,
            session,
            end_tx,
            closed: AtomicBool::new(false),
            op_timeout,
        });

        if keepalive > 0 {
            spawn_keepalive_monitor(Arc::downgrade(&transport), Duration::from_secs(keepalive as u64));
        }

        Ok(transport)
    }
}

type Established = (String, Session, Duration, u32);

/// Blocking connect, handshake and authentication
fn connect_blocking(
    config: &SshConfig,
    settings: &SshSettings,
    known_hosts: Option<&Path>,
) -> AppResult<Established> {
    let label = format!("{}@{}:{}", config.username, config.host, config.port);
    let timeout = settings.connect_timeout();

    // Log connection attempt (no secrets!)
    tracing::info!("Connecting to {}", label);

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| AppError::Connection(format!("Failed to resolve {}: {}", config.host, e)))?
        .next()
        .ok_or_else(|| AppError::Connection(format!("No address found for {}", config.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
        io::ErrorKind::TimedOut => AppError::Timeout(format!("TCP connect to {} timed out", label)),
        _ => AppError::transport("TCP connect failed", e),
    })?;
    tcp.set_nodelay(true)?;

    let mut session = Session::new()
        .map_err(|e| AppError::Ssh(format!("Failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis() as u32);

    if !config.ciphers().is_empty() {
        let prefs = config.ciphers().join(",");
        session
            .method_pref(MethodType::CryptCs, &prefs)
            .map_err(|e| AppError::InvalidConfig(format!("Unsupported cipher list: {}", e)))?;
        session
            .method_pref(MethodType::CryptSc, &prefs)
            .map_err(|e| AppError::InvalidConfig(format!("Unsupported cipher list: {}", e)))?;
    }

    session
        .handshake()
        .map_err(|e| AppError::transport("SSH handshake failed", e))?;

    verify_host_key(&session, config, known_hosts)?;
    authenticate(&session, config, settings.use_agent)?;

    // From here on every call goes through `retry`
    session.set_timeout(0);
    session.set_blocking(false);
    if settings.keepalive_interval > 0 {
        session.set_keepalive(true, settings.keepalive_interval);
    }

    tracing::info!("SSH connected successfully ({})", label);
    Ok((label, session, timeout, settings.keepalive_interval))
}

/// Trust on first use, refuse on mismatch
fn verify_host_key(session: &Session, config: &SshConfig, known_hosts_path: Option<&Path>) -> AppResult<()> {
    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| AppError::Ssh("No host key received".to_string()))?;

    let fingerprint = compute_sha256_fingerprint(key);
    tracing::debug!("Host key for {}:{} is {}", config.host, config.port, fingerprint);

    let Some(known_hosts_path) = known_hosts_path else {
        return Ok(());
    };

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| AppError::Ssh(format!("Failed to create known_hosts: {}", e)))?;
    if known_hosts_path.exists() {
        let _ = known_hosts.read_file(known_hosts_path, KnownHostFileKind::OpenSSH);
    }

    match known_hosts.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => {
            tracing::info!(
                "Trusting new host key for {}:{} ({})",
                config.host,
                config.port,
                fingerprint
            );
            let key_format: KnownHostKeyFormat = key_type.into();
            let host = if config.port == 22 {
                config.host.clone()
            } else {
                format!("[{}]:{}", config.host, config.port)
            };
            known_hosts
                .add(&host, key, &format!("added by sshdock on {}", chrono::Utc::now()), key_format)
                .map_err(|e| AppError::Ssh(format!("Failed to add known host: {}", e)))?;
            if let Some(parent) = known_hosts_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            known_hosts
                .write_file(known_hosts_path, KnownHostFileKind::OpenSSH)
                .map_err(|e| AppError::Ssh(format!("Failed to write known_hosts: {}", e)))?;
            Ok(())
        }
        CheckResult::Mismatch => {
            tracing::error!(
                "HOST KEY MISMATCH for {}:{}! Possible MITM attack!",
                config.host,
                config.port
            );
            Err(AppError::Auth(format!(
                "Host key for {}:{} has changed. Remove the old key from {} if you trust this change.",
                config.host,
                config.port,
                known_hosts_path.display()
            )))
        }
        CheckResult::Failure => Err(AppError::Ssh("Failed to check known hosts".to_string())),
    }
}

/// Password, then private key, then agent
fn authenticate(session: &Session, config: &SshConfig, use_agent: bool) -> AppResult<()> {
    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        session
            .userauth_password(&config.username, password)
            .map_err(|_| AppError::Auth("Password authentication failed".to_string()))?;
    } else if let Some(key_data) = &config.private_key {
        // libssh2 wants a file; write it out with tight permissions and remove it right after
        let key_file_path =
            std::env::temp_dir().join(format!("sshdock_key_{}", uuid::Uuid::new_v4()));
        std::fs::write(&key_file_path, key_data)
            .map_err(|e| AppError::Auth(format!("Failed to write temp key file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&key_file_path, std::fs::Permissions::from_mode(0o600));
        }

        let auth_result = session.userauth_pubkey_file(
            &config.username,
            None,
            &key_file_path,
            config.passphrase.as_deref(),
        );
        let _ = std::fs::remove_file(&key_file_path);

        auth_result.map_err(|e| {
            let msg = e.to_string().to_lowercase();
            if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
                AppError::Auth("Invalid passphrase or key format. Ensure the key is in PEM or OpenSSH format.".to_string())
            } else if msg.contains("denied") || msg.contains("auth") {
                AppError::Auth("Private key not accepted by server".to_string())
            } else {
                AppError::Auth("Private key authentication failed".to_string())
            }
        })?;
    } else if use_agent {
        let mut agent = session
            .agent()
            .map_err(|_| AppError::Auth("SSH agent not available. Make sure ssh-agent is running.".to_string()))?;
        agent
            .connect()
            .map_err(|_| AppError::Auth("Failed to connect to SSH agent. Is it running?".to_string()))?;
        agent
            .list_identities()
            .map_err(|_| AppError::Auth("Failed to list SSH agent identities".to_string()))?;

        let identities = agent.identities().unwrap_or_default();
        if identities.is_empty() {
            return Err(AppError::Auth("No identities found in SSH agent. Add keys with ssh-add.".to_string()));
        }
        if !identities
            .iter()
            .any(|identity| agent.userauth(&config.username, identity).is_ok())
        {
            return Err(AppError::Auth("SSH agent authentication failed. No matching key accepted.".to_string()));
        }
    } else {
        return Err(AppError::Auth("No password or private key configured".to_string()));
    }

    if !session.authenticated() {
        return Err(AppError::Auth("Authentication failed".to_string()));
    }
    Ok(())
}

/// Sends keepalives and flips the end signal when the peer stops answering.
fn spawn_keepalive_monitor(transport: Weak<Ssh2Transport>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        let Some(transport) = transport.upgrade() else {
            return;
        };
        if transport.closed.load(Ordering::SeqCst) {
            return;
        }
        let session = transport.session.clone();
        if let Err(e) = retry(transport.op_timeout, "keepalive", transport_err, || {
            session.keepalive_send()
        }) {
            tracing::warn!("Keepalive failed for {}: {}", transport.label, e);
            transport.close();
            return;
        }
    });
}

/// One authenticated libssh2 session
pub struct Ssh2Transport {
    label: String,
    session: Session,
    end_tx: watch::Sender<bool>,
    closed: AtomicBool,
    op_timeout: Duration,
}

#[async_trait]
impl Transport for Ssh2Transport {
    async fn exec(&self, command: &str) -> AppResult<String> {
        let session = self.session.clone();
        let timeout = self.op_timeout;
        let command = command.to_string();

        tokio::task::spawn_blocking(move || -> AppResult<String> {
            let mut channel = retry(timeout, "open channel", transport_err, || session.channel_session())?;
            retry(timeout, "exec", transport_err, || channel.exec(&command))?;

            let mut output = String::new();
            BlockingIo {
                inner: &mut channel,
                idle_timeout: timeout,
            }
            .read_to_string(&mut output)
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut => AppError::Timeout("exec output timed out".to_string()),
                _ => AppError::transport("exec read failed", e),
            })?;

            retry(timeout, "close channel", transport_err, || channel.wait_close())?;
            let status = channel.exit_status().unwrap_or(0);
            if status != 0 {
                return Err(AppError::Protocol(format!("Command exited with status {}", status)));
            }
            Ok(output)
        })
        .await?
    }

    async fn open_file_channel(&self) -> AppResult<Arc<dyn FileChannel>> {
        let session = self.session.clone();
        let timeout = self.op_timeout;
        let sftp = tokio::task::spawn_blocking(move || {
            retry(timeout, "open SFTP", transport_err, || session.sftp())
        })
        .await??;

        Ok(Arc::new(Ssh2Files {
            sftp: Mutex::new(sftp),
            timeout,
        }))
    }

    async fn forward_out(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> AppResult<Box<dyn ForwardChannel>> {
        let session = self.session.clone();
        let timeout = self.op_timeout;
        let remote_host = remote_host.to_string();
        let channel = tokio::task::spawn_blocking(move || {
            retry(timeout, "open direct-tcpip channel", transport_err, || {
                session.channel_direct_tcpip(&remote_host, remote_port, None)
            })
        })
        .await??;

        Ok(Box::new(Ssh2Forward { channel }))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Closing SSH session {}", self.label);
        let session = self.session.clone();
        let _ = retry(Duration::from_millis(500), "disconnect", transport_err, || {
            session.disconnect(None, "closing", None)
        });
        self.end_tx.send_replace(true);
    }

    fn end_signal(&self) -> watch::Receiver<bool> {
        self.end_tx.subscribe()
    }
}

impl Drop for Ssh2Transport {
    fn drop(&mut self) {
        self.close();
    }
}

struct Ssh2Forward {
    channel: ssh2::Channel,
}

impl Read for Ssh2Forward {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }
}

impl Write for Ssh2Forward {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.channel.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel.flush()
    }
}

impl ForwardChannel for Ssh2Forward {
    fn is_eof(&self) -> bool {
        self.channel.eof()
    }

    fn send_eof(&mut self) -> io::Result<()> {
        let channel = &mut self.channel;
        retry(Duration::from_secs(5), "send forward EOF", transport_err, || {
            channel.send_eof()
        })
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn shutdown(&mut self) {
        let channel = &mut self.channel;
        let _ = retry(Duration::from_millis(500), "close forward", transport_err, || {
            channel.close()
        });
    }
}

/// SFTP subsystem on a pooled session
struct Ssh2Files {
    sftp: Mutex<Sftp>,
    timeout: Duration,
}

impl FileChannel for Ssh2Files {
    fn read_dir(&self, path: &Path) -> AppResult<Vec<(PathBuf, RemoteStat)>> {
        let sftp = self.sftp.lock();
        let entries = retry(self.timeout, "list directory", protocol_err, || sftp.readdir(path))?;
        Ok(entries
            .into_iter()
            .map(|(p, stat)| (p, to_remote_stat(&stat)))
            .collect())
    }

    fn stat(&self, path: &Path) -> AppResult<RemoteStat> {
        let sftp = self.sftp.lock();
        let stat = retry(self.timeout, "stat", protocol_err, || sftp.stat(path))?;
        Ok(to_remote_stat(&stat))
    }

    fn open_read(&self, path: &Path) -> AppResult<Box<dyn Read>> {
        let sftp = self.sftp.lock();
        let file = retry(self.timeout, "open file", protocol_err, || sftp.open(path))?;
        Ok(Box::new(BlockingIo {
            inner: file,
            idle_timeout: self.timeout,
        }))
    }

    fn create(&self, path: &Path) -> AppResult<Box<dyn Write>> {
        let sftp = self.sftp.lock();
        let file = retry(self.timeout, "create file", protocol_err, || sftp.create(path))?;
        Ok(Box::new(BlockingIo {
            inner: file,
            idle_timeout: self.timeout,
        }))
    }

    fn mkdir(&self, path: &Path, mode: i32) -> AppResult<()> {
        let sftp = self.sftp.lock();
        retry(self.timeout, "create directory", protocol_err, || sftp.mkdir(path, mode))
    }

    fn unlink(&self, path: &Path) -> AppResult<()> {
        let sftp = self.sftp.lock();
        retry(self.timeout, "delete file", protocol_err, || sftp.unlink(path))
    }

    fn rmdir(&self, path: &Path) -> AppResult<()> {
        let sftp = self.sftp.lock();
        retry(self.timeout, "delete directory", protocol_err, || sftp.rmdir(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> AppResult<()> {
        let sftp = self.sftp.lock();
        retry(self.timeout, "rename", protocol_err, || sftp.rename(from, to, None))
    }

    fn realpath(&self, path: &Path) -> AppResult<PathBuf> {
        let sftp = self.sftp.lock();
        retry(self.timeout, "realpath", protocol_err, || sftp.realpath(path))
    }
}

fn to_remote_stat(stat: &FileStat) -> RemoteStat {
    let file_type = stat.file_type();
    let kind = if file_type.is_dir() {
        FileKind::Dir
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    };
    RemoteStat {
        kind,
        size: stat.size.unwrap_or(0),
        perm: stat.perm.unwrap_or(0) & 0o7777,
        mtime: stat.mtime.map(|t| t as i64),
    }
}

/// Compute SHA256 fingerprint of a key
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    // Format as SHA256:base64
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = compute_sha256_fingerprint(b"test key data");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_blocking_io_retries_would_block() {
        struct Flaky {
            pending: u32,
        }
        impl Read for Flaky {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.pending > 0 {
                    self.pending -= 1;
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                buf[0] = b'x';
                Ok(1)
            }
        }

        let mut io = BlockingIo {
            inner: Flaky { pending: 3 },
            idle_timeout: Duration::from_secs(1),
        };
        let mut buf = [0u8; 4];
        assert_eq!(io.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'x');
    }

    #[test]
    fn test_blocking_io_gives_up_after_idle_timeout() {
        struct Stuck;
        impl Read for Stuck {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::WouldBlock.into())
            }
        }

        let mut io = BlockingIo {
            inner: Stuck,
            idle_timeout: Duration::from_millis(20),
        };
        let err = io.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
