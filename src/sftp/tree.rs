//! Recursive remote tree snapshot and local replication.

use crate::config::SshConfig;
use crate::error::{AppError, AppResult};
use crate::logging::{self, LogLevel, LogSubsystem};
use crate::sftp::{join_remote, RemoteFs};
use crate::ssh::{ConnectionPool, RemoteStat};
use crate::storage::{create_dir_chain, FileStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A remote file or a directory owning its children, ordered by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteTreeNode {
    File(RemoteStat),
    Directory(BTreeMap<String, RemoteTreeNode>),
}

impl RemoteTreeNode {
    pub fn is_dir(&self) -> bool {
        matches!(self, RemoteTreeNode::Directory(_))
    }

    pub fn child(&self, name: &str) -> Option<&RemoteTreeNode> {
        match self {
            RemoteTreeNode::Directory(children) => children.get(name),
            RemoteTreeNode::File(_) => None,
        }
    }

    pub fn file_count(&self) -> usize {
        match self {
            RemoteTreeNode::File(_) => 1,
            RemoteTreeNode::Directory(children) => children.values().map(Self::file_count).sum(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        match self {
            RemoteTreeNode::File(stat) => stat.size,
            RemoteTreeNode::Directory(children) => children.values().map(Self::total_bytes).sum(),
        }
    }
}

/// What to do when one item of a walk fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailurePolicy {
    /// Abort the whole walk and return the error
    AllOrNothing,
    /// Record the failure and carry on
    BestEffort,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub snapshot_policy: FailurePolicy,
    pub replicate_policy: FailurePolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            snapshot_policy: FailurePolicy::AllOrNothing,
            replicate_policy: FailurePolicy::BestEffort,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub files_copied: usize,
    pub bytes_copied: u64,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    fn fail(&mut self, policy: FailurePolicy, path: String, err: AppError) -> AppResult<()> {
        match policy {
            FailurePolicy::AllOrNothing => Err(err),
            FailurePolicy::BestEffort => {
                logging::report(LogSubsystem::Sync, &format!("Skipping {}", path), &err);
                self.failures.push(SyncFailure {
                    path,
                    error: err.to_string(),
                });
                Ok(())
            }
        }
    }
}

/// Walk `remote_path` depth first. Hidden entries are left out.
pub fn snapshot(
    fs: &RemoteFs,
    remote_path: &str,
    policy: FailurePolicy,
) -> AppResult<(RemoteTreeNode, SyncReport)> {
    let mut report = SyncReport::default();
    let root = walk(fs, remote_path, policy, &mut report)?;
    Ok((root, report))
}

fn walk(
    fs: &RemoteFs,
    remote_path: &str,
    policy: FailurePolicy,
    report: &mut SyncReport,
) -> AppResult<RemoteTreeNode> {
    let mut children = BTreeMap::new();

    let entries = match fs.channel().read_dir(Path::new(remote_path)) {
        Ok(entries) => entries,
        Err(e) => {
            report.fail(policy, remote_path.to_string(), e)?;
            return Ok(RemoteTreeNode::Directory(children));
        }
    };

    for (path, stat) in entries {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let node = if stat.is_dir() {
            walk(fs, &join_remote(remote_path, &name), policy, report)?
        } else {
            RemoteTreeNode::File(stat)
        };
        children.insert(name, node);
    }

    Ok(RemoteTreeNode::Directory(children))
}

/// Copy every file in `tree` from under `remote_root` to under `local_root`.
pub fn replicate(
    fs: &RemoteFs,
    tree: &RemoteTreeNode,
    remote_root: &str,
    local_root: &Path,
    policy: FailurePolicy,
) -> AppResult<SyncReport> {
    let mut report = SyncReport::default();
    match tree {
        RemoteTreeNode::Directory(children) => {
            replicate_dir(fs, children, remote_root, local_root, policy, &mut report)?
        }
        RemoteTreeNode::File(_) => {
            let name = Path::new(remote_root)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| AppError::InvalidConfig(format!("Not a file path: {}", remote_root)))?;
            replicate_file(fs, remote_root, local_root, &name, policy, &mut report)?
        }
    }
    Ok(report)
}

fn replicate_dir(
    fs: &RemoteFs,
    children: &BTreeMap<String, RemoteTreeNode>,
    remote_dir: &str,
    local_dir: &Path,
    policy: FailurePolicy,
    report: &mut SyncReport,
) -> AppResult<()> {
    for (name, node) in children {
        let remote_path = join_remote(remote_dir, name);
        match node {
            RemoteTreeNode::Directory(grandchildren) => replicate_dir(
                fs,
                grandchildren,
                &remote_path,
                &local_dir.join(name),
                policy,
                report,
            )?,
            RemoteTreeNode::File(_) => {
                replicate_file(fs, &remote_path, local_dir, name, policy, report)?
            }
        }
    }
    Ok(())
}

fn replicate_file(
    fs: &RemoteFs,
    remote_path: &str,
    local_dir: &Path,
    name: &str,
    policy: FailurePolicy,
    report: &mut SyncReport,
) -> AppResult<()> {
    match copy_to_local(fs, remote_path, local_dir, name) {
        Ok(bytes) => {
            report.files_copied += 1;
            report.bytes_copied += bytes;
            Ok(())
        }
        Err(e) => report.fail(policy, remote_path.to_string(), e),
    }
}

fn copy_to_local(fs: &RemoteFs, remote_path: &str, local_dir: &Path, name: &str) -> AppResult<u64> {
    create_dir_chain(local_dir)?;
    let mut source = fs.channel().open_read(Path::new(remote_path))?;
    let mut target = File::create(local_dir.join(name))?;
    let bytes = std::io::copy(&mut source, &mut target)
        .map_err(|e| AppError::protocol(&format!("Failed to copy {}", remote_path), e))?;
    tracing::trace!("Copied {} ({} bytes)", remote_path, bytes);
    Ok(bytes)
}

/// Mirror `remote_path` under `<storage>/temp/<identifier><remote_path>`.
pub async fn sync_local(
    pool: &ConnectionPool,
    store: &FileStore,
    config: &SshConfig,
    remote_path: &str,
    options: SyncOptions,
) -> AppResult<(PathBuf, SyncReport)> {
    let local_root = store.mirror_path(&config.identifier(), remote_path)?;
    let session = pool.acquire(config, true).await?;
    let fs = RemoteFs::new(session.file_channel().await?);

    logging::log_endpoint(
        LogLevel::Info,
        LogSubsystem::Sync,
        config.connection_id(),
        format!("Syncing {} to {}", remote_path, local_root.display()),
    );

    let remote = remote_path.to_string();
    let target = local_root.clone();
    let report = fs
        .run(move |fs| {
            let (tree, mut report) = snapshot(fs, &remote, options.snapshot_policy)?;
            let copied = replicate(fs, &tree, &remote, &target, options.replicate_policy)?;
            report.files_copied = copied.files_copied;
            report.bytes_copied = copied.bytes_copied;
            report.failures.extend(copied.failures);
            Ok(report)
        })
        .await?;

    logging::log_endpoint(
        LogLevel::Info,
        LogSubsystem::Sync,
        config.connection_id(),
        format!(
            "Synced {} files ({} bytes), {} failed",
            report.files_copied,
            report.bytes_copied,
            report.failures.len()
        ),
    );
    Ok((local_root, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_config, FakeConnector, MemFs};
    use std::sync::Arc;

    fn sample() -> (MemFs, RemoteFs) {
        let mem = MemFs::new();
        mem.add_file("/r/a.txt", b"0123456789");
        mem.add_file("/r/sub/b.txt", b"12345");
        mem.add_file("/r/.env", b"SECRET=1");
        mem.add_file("/r/.git/HEAD", b"ref");
        mem.add_dir("/r/empty");
        (mem.clone(), RemoteFs::new(Arc::new(mem)))
    }

    #[test]
    fn test_snapshot_skips_hidden_entries() {
        let (_, fs) = sample();
        let (tree, report) = snapshot(&fs, "/r", FailurePolicy::AllOrNothing).unwrap();
        assert!(report.failures.is_empty());
        assert!(tree.child(".env").is_none());
        assert!(tree.child(".git").is_none());
        assert_eq!(tree.file_count(), 2);
        assert_eq!(tree.total_bytes(), 15);
        assert!(tree.child("sub").unwrap().is_dir());
        assert!(tree.child("empty").unwrap().is_dir());
    }

    #[test]
    fn test_snapshot_all_or_nothing_rejects_on_listing_failure() {
        let (mem, fs) = sample();
        mem.fail_path("/r/sub");
        assert!(snapshot(&fs, "/r", FailurePolicy::AllOrNothing).is_err());
    }

    #[test]
    fn test_snapshot_best_effort_records_listing_failure() {
        let (mem, fs) = sample();
        mem.fail_path("/r/sub");
        let (tree, report) = snapshot(&fs, "/r", FailurePolicy::BestEffort).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "/r/sub");
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn test_replicate_builds_directory_chain() {
        let (_, fs) = sample();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("mirror").join("deep");

        let (tree, _) = snapshot(&fs, "/r", FailurePolicy::AllOrNothing).unwrap();
        let report = replicate(&fs, &tree, "/r", &local, FailurePolicy::BestEffort).unwrap();

        assert_eq!(report.files_copied, 2);
        assert_eq!(report.bytes_copied, 15);
        assert_eq!(std::fs::metadata(local.join("a.txt")).unwrap().len(), 10);
        assert_eq!(std::fs::metadata(local.join("sub").join("b.txt")).unwrap().len(), 5);
        assert!(!local.join(".env").exists());
        // Directories without files are not created
        assert!(!local.join("empty").exists());
    }

    #[test]
    fn test_replicate_best_effort_continues_past_failed_copy() {
        let (mem, fs) = sample();
        let dir = tempfile::tempdir().unwrap();
        let (tree, _) = snapshot(&fs, "/r", FailurePolicy::AllOrNothing).unwrap();
        mem.fail_path("/r/a.txt");

        let report = replicate(&fs, &tree, "/r", dir.path(), FailurePolicy::BestEffort).unwrap();
        assert_eq!(report.files_copied, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(dir.path().join("sub").join("b.txt").exists());

        assert!(replicate(&fs, &tree, "/r", dir.path(), FailurePolicy::AllOrNothing).is_err());
    }

    #[tokio::test]
    async fn test_sync_local_mirrors_under_storage() {
        let connector = FakeConnector::new();
        connector.fs().add_file("/r/a.txt", b"0123456789");
        connector.fs().add_file("/r/sub/b.txt", b"12345");
        let pool = ConnectionPool::new(connector.clone(), Default::default());
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let mut config = test_config();
        config.name = Some("web".into());

        let (root, report) = sync_local(&pool, &store, &config, "/r", SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(root, dir.path().join("temp").join("web_deploy_10.0.0.5_22").join("r"));
        assert_eq!(report.files_copied, 2);
        assert_eq!(std::fs::read(root.join("sub").join("b.txt")).unwrap(), b"12345");
        assert!(pool.get(&config.endpoint_key().unwrap()).unwrap().has_file_channel());
    }
}
