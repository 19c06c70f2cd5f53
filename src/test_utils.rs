//! In-memory transports for unit tests.

use crate::config::SshConfig;
use crate::error::{AppError, AppResult};
use crate::ssh::transport::{
    Connector, FileChannel, ForwardChannel, RemoteStat, Transport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub fn test_config() -> SshConfig {
    let mut config = SshConfig::new("10.0.0.5", "deploy");
    config.password = Some("secret".into());
    config
}

#[derive(Default)]
struct Flags {
    fail_auth: AtomicBool,
    fail_files: AtomicBool,
    fail_forward: AtomicBool,
    break_streams: AtomicBool,
}

/// Hands out [`FakeTransport`]s that all share one in-memory remote filesystem.
pub struct FakeConnector {
    flags: Arc<Flags>,
    connects: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    fs: MemFs,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flags: Arc::new(Flags::default()),
            connects: AtomicUsize::new(0),
            delay: Mutex::new(None),
            transports: Mutex::new(Vec::new()),
            fs: MemFs::new(),
        })
    }

    pub fn fs(&self) -> &MemFs {
        &self.fs
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    pub fn last_transport(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().last().cloned()
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fail_auth(&self, fail: bool) {
        self.flags.fail_auth.store(fail, Ordering::SeqCst);
    }

    pub fn fail_file_channels(&self, fail: bool) {
        self.flags.fail_files.store(fail, Ordering::SeqCst);
    }

    pub fn fail_forwards(&self, fail: bool) {
        self.flags.fail_forward.store(fail, Ordering::SeqCst);
    }

    /// Forwarded streams error out on their next read.
    pub fn break_streams(&self, broken: bool) {
        self.flags.break_streams.store(broken, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _config: &SshConfig) -> AppResult<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.flags.fail_auth.load(Ordering::SeqCst) {
            return Err(AppError::Auth("Password authentication failed".to_string()));
        }

        let (end_tx, _) = watch::channel(false);
        let transport = Arc::new(FakeTransport {
            flags: Arc::clone(&self.flags),
            fs: self.fs.clone(),
            end_tx,
            closes: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            fail_probes: AtomicBool::new(false),
            hang_probes: AtomicBool::new(false),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub struct FakeTransport {
    flags: Arc<Flags>,
    fs: MemFs,
    end_tx: watch::Sender<bool>,
    closes: AtomicUsize,
    execs: AtomicUsize,
    fail_probes: AtomicBool,
    hang_probes: AtomicBool,
}

impl FakeTransport {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    pub fn hang_probes(&self, hang: bool) {
        self.hang_probes.store(hang, Ordering::SeqCst);
    }

    /// The peer went away without anyone calling `close`.
    pub fn simulate_end(&self) {
        self.end_tx.send_replace(true);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&self, command: &str) -> AppResult<String> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if self.hang_probes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_probes.load(Ordering::SeqCst) {
            return Err(AppError::Ssh("channel open failed".to_string()));
        }
        Ok(command.trim_start_matches("echo ").trim_matches('"').to_string() + "\n")
    }

    async fn open_file_channel(&self) -> AppResult<Arc<dyn FileChannel>> {
        if self.flags.fail_files.load(Ordering::SeqCst) {
            return Err(AppError::Protocol("subsystem request failed".to_string()));
        }
        Ok(Arc::new(self.fs.clone()))
    }

    async fn forward_out(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> AppResult<Box<dyn ForwardChannel>> {
        if self.flags.fail_forward.load(Ordering::SeqCst) {
            return Err(AppError::Ssh(format!(
                "Connection refused by {}:{}",
                remote_host, remote_port
            )));
        }
        Ok(Box::new(EchoChannel {
            pending: VecDeque::new(),
            flags: Arc::clone(&self.flags),
            input_done: false,
            closed: false,
        }))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.end_tx.send_replace(true);
    }

    fn end_signal(&self) -> watch::Receiver<bool> {
        self.end_tx.subscribe()
    }
}

/// A remote service that writes back whatever it receives, and closes once
/// its input has ended and everything was echoed.
struct EchoChannel {
    pending: VecDeque<u8>,
    flags: Arc<Flags>,
    input_done: bool,
    closed: bool,
}

impl Read for EchoChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.flags.break_streams.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel stream failed"));
        }
        if self.pending.is_empty() {
            if self.input_done {
                self.closed = true;
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for EchoChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ForwardChannel for EchoChannel {
    fn is_eof(&self) -> bool {
        self.closed
    }

    fn send_eof(&mut self) -> io::Result<()> {
        self.input_done = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug, Clone)]
enum MemNode {
    File(Vec<u8>),
    Dir,
}

#[derive(Default)]
struct MemFsInner {
    nodes: Mutex<BTreeMap<PathBuf, MemNode>>,
    failing: Mutex<HashSet<PathBuf>>,
    calls: AtomicUsize,
}

/// Remote filesystem kept in a map of absolute paths.
#[derive(Clone)]
pub struct MemFs {
    inner: Arc<MemFsInner>,
}

impl MemFs {
    pub fn new() -> Self {
        let fs = Self {
            inner: Arc::new(MemFsInner::default()),
        };
        fs.inner.nodes.lock().insert(PathBuf::from("/"), MemNode::Dir);
        fs
    }

    pub fn add_dir(&self, path: &str) {
        let mut nodes = self.inner.nodes.lock();
        for ancestor in Path::new(path).ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            nodes.entry(ancestor.to_path_buf()).or_insert(MemNode::Dir);
        }
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        if let Some(parent) = Path::new(path).parent() {
            self.add_dir(&parent.to_string_lossy());
        }
        self.inner
            .nodes
            .lock()
            .insert(PathBuf::from(path), MemNode::File(content.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.inner.nodes.lock().get(Path::new(path)) {
            Some(MemNode::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.inner.nodes.lock().contains_key(Path::new(path))
    }

    /// Every operation on `path` fails from now on.
    pub fn fail_path(&self, path: &str) {
        self.inner.failing.lock().insert(PathBuf::from(path));
    }

    /// Number of file operations served so far.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    fn enter(&self, path: &Path) -> AppResult<()> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.failing.lock().contains(path) {
            return Err(AppError::Protocol(format!("Permission denied: {}", path.display())));
        }
        Ok(())
    }

    fn stat_node(node: &MemNode) -> RemoteStat {
        match node {
            MemNode::File(data) => RemoteStat::file(data.len() as u64),
            MemNode::Dir => RemoteStat::dir(),
        }
    }

    fn missing(path: &Path) -> AppError {
        AppError::Protocol(format!("No such file: {}", path.display()))
    }
}

impl FileChannel for MemFs {
    fn read_dir(&self, path: &Path) -> AppResult<Vec<(PathBuf, RemoteStat)>> {
        self.enter(path)?;
        let nodes = self.inner.nodes.lock();
        match nodes.get(path) {
            Some(MemNode::Dir) => {}
            Some(MemNode::File(_)) => {
                return Err(AppError::Protocol(format!("Not a directory: {}", path.display())))
            }
            None => return Err(Self::missing(path)),
        }
        // Like libssh2's readdir, "." and ".." are never returned.
        Ok(nodes
            .iter()
            .filter(|(p, _)| p.parent() == Some(path) && p.as_path() != path)
            .map(|(p, node)| (p.clone(), Self::stat_node(node)))
            .collect())
    }

    fn stat(&self, path: &Path) -> AppResult<RemoteStat> {
        self.enter(path)?;
        self.inner
            .nodes
            .lock()
            .get(path)
            .map(Self::stat_node)
            .ok_or_else(|| Self::missing(path))
    }

    fn open_read(&self, path: &Path) -> AppResult<Box<dyn Read>> {
        self.enter(path)?;
        match self.inner.nodes.lock().get(path) {
            Some(MemNode::File(data)) => Ok(Box::new(Cursor::new(data.clone()))),
            _ => Err(Self::missing(path)),
        }
    }

    fn create(&self, path: &Path) -> AppResult<Box<dyn Write>> {
        self.enter(path)?;
        let mut nodes = self.inner.nodes.lock();
        match path.parent().and_then(|p| nodes.get(p)) {
            Some(MemNode::Dir) => {}
            _ => return Err(Self::missing(path)),
        }
        nodes.insert(path.to_path_buf(), MemNode::File(Vec::new()));
        Ok(Box::new(MemWriter {
            fs: self.clone(),
            path: path.to_path_buf(),
        }))
    }

    fn mkdir(&self, path: &Path, _mode: i32) -> AppResult<()> {
        self.enter(path)?;
        let mut nodes = self.inner.nodes.lock();
        if nodes.contains_key(path) {
            return Err(AppError::Protocol(format!("File exists: {}", path.display())));
        }
        match path.parent().and_then(|p| nodes.get(p)) {
            Some(MemNode::Dir) => {
                nodes.insert(path.to_path_buf(), MemNode::Dir);
                Ok(())
            }
            _ => Err(Self::missing(path)),
        }
    }

    fn unlink(&self, path: &Path) -> AppResult<()> {
        self.enter(path)?;
        let mut nodes = self.inner.nodes.lock();
        match nodes.get(path) {
            Some(MemNode::File(_)) => {
                nodes.remove(path);
                Ok(())
            }
            _ => Err(Self::missing(path)),
        }
    }

    fn rmdir(&self, path: &Path) -> AppResult<()> {
        self.enter(path)?;
        let mut nodes = self.inner.nodes.lock();
        if !matches!(nodes.get(path), Some(MemNode::Dir)) {
            return Err(Self::missing(path));
        }
        if nodes.keys().any(|p| p.parent() == Some(path) && p.as_path() != path) {
            return Err(AppError::Protocol(format!("Directory not empty: {}", path.display())));
        }
        nodes.remove(path);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> AppResult<()> {
        self.enter(from)?;
        let mut nodes = self.inner.nodes.lock();
        let moved: Vec<(PathBuf, MemNode)> = nodes
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect();
        if moved.is_empty() {
            return Err(Self::missing(from));
        }
        for (old, node) in moved {
            nodes.remove(&old);
            let target = match old.strip_prefix(from) {
                Ok(suffix) if !suffix.as_os_str().is_empty() => to.join(suffix),
                _ => to.to_path_buf(),
            };
            nodes.insert(target, node);
        }
        Ok(())
    }

    fn realpath(&self, path: &Path) -> AppResult<PathBuf> {
        self.enter(path)?;
        if path == Path::new(".") {
            return Ok(PathBuf::from("/home/deploy"));
        }
        Ok(path.to_path_buf())
    }
}

struct MemWriter {
    fs: MemFs,
    path: PathBuf,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut nodes = self.fs.inner.nodes.lock();
        match nodes.get_mut(&self.path) {
            Some(MemNode::File(data)) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "file vanished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
