//! Remote file operations over a pooled session's file channel.
//!
//! `RemoteFs` methods are blocking; async callers go through [`RemoteFs::run`].

pub mod transfer;
pub mod tree;

use crate::error::AppResult;
use crate::ssh::{FileChannel, RemoteStat};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Remote file/directory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: Option<i64>,
    pub permissions: String,
}

impl RemoteEntry {
    fn from_stat(name: String, path: String, stat: &RemoteStat) -> Self {
        Self {
            name,
            path,
            is_dir: stat.is_dir(),
            is_symlink: stat.is_symlink(),
            size: stat.size,
            modified: stat.mtime,
            permissions: format_permissions(stat),
        }
    }
}

/// Join a remote directory and a child name with `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// File operations on one file channel
#[derive(Clone)]
pub struct RemoteFs {
    channel: Arc<dyn FileChannel>,
}

impl RemoteFs {
    pub fn new(channel: Arc<dyn FileChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<dyn FileChannel> {
        &self.channel
    }

    /// Run blocking file operations off the async runtime.
    pub async fn run<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&RemoteFs) -> AppResult<T> + Send + 'static,
    {
        let fs = self.clone();
        tokio::task::spawn_blocking(move || op(&fs)).await?
    }

    /// List directory contents, directories first
    pub fn list_dir(&self, path: &str) -> AppResult<Vec<RemoteEntry>> {
        let path = if path.is_empty() { "." } else { path };
        let entries = self.channel.read_dir(Path::new(path))?;

        let mut result: Vec<RemoteEntry> = entries
            .into_iter()
            .filter_map(|(file_path, stat)| {
                let name = file_path.file_name()?.to_string_lossy().to_string();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteEntry::from_stat(
                    name.clone(),
                    join_remote(path, &name),
                    &stat,
                ))
            })
            .collect();

        result.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(result)
    }

    /// Get file/directory info
    pub fn stat(&self, path: &str) -> AppResult<RemoteEntry> {
        let stat = self.channel.stat(Path::new(path))?;
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string());
        Ok(RemoteEntry::from_stat(name, path.to_string(), &stat))
    }

    pub fn mkdir(&self, path: &str) -> AppResult<()> {
        self.channel.mkdir(Path::new(path), 0o755)
    }

    /// Create an empty remote file
    pub fn new_file(&self, path: &str) -> AppResult<()> {
        let mut file = self.channel.create(Path::new(path))?;
        file.flush()?;
        Ok(())
    }

    pub fn delete_file(&self, path: &str) -> AppResult<()> {
        self.channel.unlink(Path::new(path))
    }

    /// Delete a directory and everything under it, depth first
    pub fn delete_dir_recursive(&self, path: &str) -> AppResult<()> {
        for entry in self.list_dir(path)? {
            if entry.is_dir {
                self.delete_dir_recursive(&entry.path)?;
            } else {
                self.channel.unlink(Path::new(&entry.path))?;
            }
        }
        self.channel.rmdir(Path::new(path))?;
        tracing::debug!("Deleted remote directory {}", path);
        Ok(())
    }

    /// Rename/move a file or directory
    pub fn rename(&self, from: &str, to: &str) -> AppResult<()> {
        self.channel.rename(Path::new(from), Path::new(to))
    }

    /// Get home directory
    pub fn home_dir(&self) -> AppResult<String> {
        match self.channel.realpath(Path::new(".")) {
            Ok(path) => Ok(path.to_string_lossy().to_string()),
            Err(_) => Ok("/".to_string()),
        }
    }
}

/// Format file permissions as a string like "drwxr-xr-x"
pub fn format_permissions(stat: &RemoteStat) -> String {
    let perms = stat.perm;
    let mut s = String::with_capacity(10);

    s.push(if stat.is_dir() {
        'd'
    } else if stat.is_symlink() {
        'l'
    } else {
        '-'
    });

    for shift in [6, 3, 0] {
        let bits = (perms >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    s
}
