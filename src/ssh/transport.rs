//! Seams between the pool and the SSH library.
//!
//! Everything above this module (pool, tunnels, sync, transfers) talks to these
//! traits, so the libssh2 backend can be swapped for in-memory fakes in tests.

use crate::config::SshConfig;
use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Attributes of a remote path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStat {
    pub kind: FileKind,
    pub size: u64,
    /// Permission bits only (`0o755`)
    pub perm: u32,
    pub mtime: Option<i64>,
}

impl RemoteStat {
    pub fn file(size: u64) -> Self {
        Self {
            kind: FileKind::File,
            size,
            perm: 0o644,
            mtime: None,
        }
    }

    pub fn dir() -> Self {
        Self {
            kind: FileKind::Dir,
            size: 0,
            perm: 0o755,
            mtime: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

/// Blocking SFTP-style file operations. Call from `spawn_blocking`.
pub trait FileChannel: Send + Sync {
    fn read_dir(&self, path: &Path) -> AppResult<Vec<(PathBuf, RemoteStat)>>;
    fn stat(&self, path: &Path) -> AppResult<RemoteStat>;
    fn open_read(&self, path: &Path) -> AppResult<Box<dyn Read>>;
    fn create(&self, path: &Path) -> AppResult<Box<dyn Write>>;
    fn mkdir(&self, path: &Path, mode: i32) -> AppResult<()>;
    fn unlink(&self, path: &Path) -> AppResult<()>;
    fn rmdir(&self, path: &Path) -> AppResult<()>;
    fn rename(&self, from: &Path, to: &Path) -> AppResult<()>;
    fn realpath(&self, path: &Path) -> AppResult<PathBuf>;
}

/// One direct-tcpip stream. Reads return `WouldBlock` when nothing is pending.
pub trait ForwardChannel: Read + Write + Send {
    /// The remote side has sent EOF.
    fn is_eof(&self) -> bool;
    /// Half-close: nothing more will be written, reads keep working.
    fn send_eof(&mut self) -> io::Result<()>;
    fn shutdown(&mut self);
}

/// An authenticated connection to one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a command and collect its stdout.
    async fn exec(&self, command: &str) -> AppResult<String>;

    async fn open_file_channel(&self) -> AppResult<Arc<dyn FileChannel>>;

    async fn forward_out(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> AppResult<Box<dyn ForwardChannel>>;

    /// Tear the connection down. Flips the end signal.
    fn close(&self);

    /// Becomes `true` once the connection has ended for any reason.
    fn end_signal(&self) -> watch::Receiver<bool>;
}

/// Opens transports. Timeouts are applied by the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> AppResult<Arc<dyn Transport>>;
}
