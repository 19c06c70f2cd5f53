//! Single-file upload and download with sampled progress and cancellation,
//! plus the open/save-back flow for editing remote files locally.

use crate::config::{SshConfig, TransferSettings};
use crate::error::{AppError, AppResult};
use crate::logging::{self, LogLevel, LogSubsystem};
use crate::sftp::RemoteFs;
use crate::ssh::ConnectionPool;
use crate::storage::{create_dir_chain, FileStore};
use dashmap::DashMap;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// One progress sample
#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub percent: f64,
    pub transferred: u64,
    pub remaining: u64,
    pub runtime_ms: u64,
    /// Bytes per second since the copy started
    pub speed: f64,
}

impl TransferProgress {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0 && self.percent >= 100.0
    }
}

/// Cancels a running transfer from another task.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: Uuid,
    cancel: Arc<AtomicBool>,
}

impl TransferHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// A single copy in one direction. Consumed by the transfer it describes.
#[derive(Debug)]
pub struct TransferJob {
    id: Uuid,
    direction: TransferDirection,
    cancel: Arc<AtomicBool>,
}

impl TransferJob {
    pub fn new(direction: TransferDirection) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn handle(&self) -> TransferHandle {
        TransferHandle {
            id: self.id,
            cancel: Arc::clone(&self.cancel),
        }
    }

    fn sample(&self, transferred: u64, total: u64, started: Instant) -> TransferProgress {
        let elapsed = started.elapsed();
        let percent = if total == 0 {
            100.0
        } else {
            (transferred as f64 / total as f64 * 100.0).min(100.0)
        };
        let secs = elapsed.as_secs_f64();
        TransferProgress {
            id: self.id,
            direction: self.direction,
            percent,
            transferred,
            remaining: total.saturating_sub(transferred),
            runtime_ms: elapsed.as_millis() as u64,
            speed: if secs > 0.0 { transferred as f64 / secs } else { 0.0 },
        }
    }

    /// Copy `reader` into `writer` in `chunk` sized pieces.
    ///
    /// Emits a sample at most once per `interval` while the copy runs and one final
    /// 100 % sample when it finishes. A cancelled copy stops after the current chunk,
    /// drops both streams and leaves whatever was already written.
    pub fn copy_with_progress<R, W, F>(
        &self,
        mut reader: R,
        mut writer: W,
        total: u64,
        interval: Duration,
        chunk: usize,
        mut on_progress: F,
    ) -> AppResult<u64>
    where
        R: Read,
        W: Write,
        F: FnMut(TransferProgress),
    {
        let started = Instant::now();
        let mut last_sample = started;
        let mut buf = vec![0u8; chunk.max(1)];
        let mut transferred = 0u64;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(AppError::Cancelled(format!(
                    "{} after {} bytes",
                    self.id, transferred
                )));
            }

            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(AppError::transport("Transfer read failed", e)),
            };
            writer
                .write_all(&buf[..n])
                .map_err(|e| AppError::transport("Transfer write failed", e))?;
            transferred += n as u64;

            if transferred < total && last_sample.elapsed() >= interval {
                last_sample = Instant::now();
                on_progress(self.sample(transferred, total, started));
            }
        }

        writer
            .flush()
            .map_err(|e| AppError::transport("Transfer flush failed", e))?;

        let mut done = self.sample(transferred, total.max(transferred), started);
        done.percent = 100.0;
        done.remaining = 0;
        on_progress(done);
        Ok(transferred)
    }
}

/// Reject files that should not be opened in memory. Checks the extension
/// first; `size` is checked only when known.
pub fn check_openable(path: &str, size: Option<u64>, settings: &TransferSettings) -> AppResult<()> {
    let extension = Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    if let Some(ext) = extension {
        if settings
            .denied_extensions
            .iter()
            .any(|denied| denied.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        {
            return Err(AppError::SizeOrTypeRejected(format!(
                "{}: .{} files cannot be opened",
                path, ext
            )));
        }
    }
    if let Some(size) = size {
        if size > settings.max_open_bytes {
            return Err(AppError::SizeOrTypeRejected(format!(
                "{}: {} bytes is over the {} byte limit",
                path, size, settings.max_open_bytes
            )));
        }
    }
    Ok(())
}

/// Download `remote` to `local`, creating the local directory chain first.
pub async fn download<F>(
    fs: &RemoteFs,
    job: TransferJob,
    remote: &str,
    local: &Path,
    settings: &TransferSettings,
    on_progress: F,
) -> AppResult<u64>
where
    F: FnMut(TransferProgress) + Send + 'static,
{
    let remote = remote.to_string();
    let local = local.to_path_buf();
    let interval = settings.progress_interval();
    let chunk = settings.chunk_size;

    let bytes = fs
        .run(move |fs| {
            let total = fs.channel().stat(Path::new(&remote))?.size;
            if let Some(parent) = local.parent() {
                create_dir_chain(parent)?;
            }
            let source = fs.channel().open_read(Path::new(&remote))?;
            let target = File::create(&local)?;
            tracing::debug!("Downloading {} to {} ({} bytes)", remote, local.display(), total);
            job.copy_with_progress(source, target, total, interval, chunk, on_progress)
        })
        .await?;
    Ok(bytes)
}

/// Upload `local` to `remote`, replacing any existing remote file.
pub async fn upload<F>(
    fs: &RemoteFs,
    job: TransferJob,
    local: &Path,
    remote: &str,
    settings: &TransferSettings,
    on_progress: F,
) -> AppResult<u64>
where
    F: FnMut(TransferProgress) + Send + 'static,
{
    let remote = remote.to_string();
    let local = local.to_path_buf();
    let interval = settings.progress_interval();
    let chunk = settings.chunk_size;

    let bytes = fs
        .run(move |fs| {
            let source = File::open(&local)?;
            let total = source.metadata()?.len();
            let target = fs.channel().create(Path::new(&remote))?;
            tracing::debug!("Uploading {} to {} ({} bytes)", local.display(), remote, total);
            job.copy_with_progress(source, target, total, interval, chunk, on_progress)
        })
        .await?;
    Ok(bytes)
}

/// Where a locally opened file came from
#[derive(Debug, Clone)]
pub struct OpenedFile {
    pub config: SshConfig,
    pub remote_path: String,
}

/// Temp file path to remote origin, for files opened through [`open_remote`].
#[derive(Default)]
pub struct OpenRegistry {
    opened: DashMap<PathBuf, OpenedFile>,
}

impl OpenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, local: &Path) -> Option<OpenedFile> {
        self.opened.get(local).map(|e| e.value().clone())
    }

    pub fn forget(&self, local: &Path) -> Option<OpenedFile> {
        self.opened.remove(local).map(|(_, opened)| opened)
    }

    pub fn len(&self) -> usize {
        self.opened.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opened.is_empty()
    }
}

/// Download a remote file into the storage mirror so it can be edited locally.
///
/// `known_size` is the size from a directory listing, if the caller has one.
/// The extension (and known size) are checked before connecting; otherwise the
/// size is checked against a fresh stat before anything is downloaded.
pub async fn open_remote(
    pool: &ConnectionPool,
    store: &FileStore,
    registry: &OpenRegistry,
    config: &SshConfig,
    remote_path: &str,
    known_size: Option<u64>,
    settings: &TransferSettings,
) -> AppResult<PathBuf> {
    check_openable(remote_path, known_size, settings)?;

    let local = store.mirror_path(&config.identifier(), remote_path)?;
    let session = pool.acquire(config, true).await?;
    let fs = RemoteFs::new(session.file_channel().await?);

    if known_size.is_none() {
        let size = fs.run({
            let remote = remote_path.to_string();
            move |fs| Ok(fs.channel().stat(Path::new(&remote))?.size)
        })
        .await?;
        check_openable(remote_path, Some(size), settings)?;
    }

    let job = TransferJob::new(TransferDirection::Download);
    download(&fs, job, remote_path, &local, settings, |p| {
        tracing::trace!("open {:.0}%", p.percent)
    })
    .await?;

    registry.opened.insert(
        local.clone(),
        OpenedFile {
            config: config.clone(),
            remote_path: remote_path.to_string(),
        },
    );
    logging::log_endpoint(
        LogLevel::Info,
        LogSubsystem::Transfer,
        config.connection_id(),
        format!("Opened {} as {}", remote_path, local.display()),
    );
    Ok(local)
}

/// Upload a file previously opened with [`open_remote`] back to where it came from.
pub async fn save_back(
    pool: &ConnectionPool,
    registry: &OpenRegistry,
    local: &Path,
    settings: &TransferSettings,
) -> AppResult<u64> {
    let opened = registry.get(local).ok_or_else(|| {
        AppError::InvalidConfig(format!("{} was not opened from a remote host", local.display()))
    })?;

    let session = pool.acquire(&opened.config, true).await?;
    let fs = RemoteFs::new(session.file_channel().await?);
    let job = TransferJob::new(TransferDirection::Upload);
    let bytes = upload(&fs, job, local, &opened.remote_path, settings, |_| {}).await?;

    logging::log_endpoint(
        LogLevel::Info,
        LogSubsystem::Transfer,
        opened.config.connection_id(),
        format!("Saved {} back to {}", local.display(), opened.remote_path),
    );
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_config, FakeConnector, MemFs};
    use std::io::Cursor;

    fn settings() -> TransferSettings {
        TransferSettings {
            progress_interval_ms: 0,
            chunk_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_progress_completes_exactly_once() {
        let job = TransferJob::new(TransferDirection::Download);
        let data = vec![7u8; 10];
        let mut out = Vec::new();
        let mut samples = Vec::new();

        let n = job
            .copy_with_progress(Cursor::new(&data), &mut out, 10, Duration::ZERO, 4, |p| {
                samples.push(p)
            })
            .unwrap();

        assert_eq!(n, 10);
        assert_eq!(out, data);
        assert_eq!(samples.iter().filter(|p| p.percent >= 100.0).count(), 1);
        assert!(samples.last().unwrap().is_complete());
        assert_eq!(samples[0].transferred, 4);
        assert_eq!(samples[0].remaining, 6);
        assert!((samples[0].percent - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_file_completes() {
        let job = TransferJob::new(TransferDirection::Upload);
        let mut samples = Vec::new();
        job.copy_with_progress(Cursor::new(Vec::new()), Vec::new(), 0, Duration::ZERO, 4, |p| {
            samples.push(p)
        })
        .unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].is_complete());
    }

    #[test]
    fn test_cancel_leaves_partial_output() {
        let job = TransferJob::new(TransferDirection::Download);
        let handle = job.handle();
        let mut out = Vec::new();

        let result = job.copy_with_progress(
            Cursor::new(vec![1u8; 16]),
            &mut out,
            16,
            Duration::ZERO,
            4,
            |_| handle.cancel(),
        );

        assert!(matches!(result, Err(AppError::Cancelled(_))));
        assert_eq!(out.len(), 4);
        assert!(job.handle().is_cancelled());
    }

    #[test]
    fn test_check_openable() {
        let settings = TransferSettings::default();
        assert!(check_openable("/srv/notes.txt", Some(1024), &settings).is_ok());
        assert!(check_openable("/srv/notes.txt", None, &settings).is_ok());
        assert!(matches!(
            check_openable("/srv/backup.TAR", Some(1), &settings),
            Err(AppError::SizeOrTypeRejected(_))
        ));
        assert!(check_openable("/srv/app.tar.gz", None, &settings).is_err());
        assert!(check_openable("/srv/huge.log", Some(10 * 1024 * 1024 + 1), &settings).is_err());
        assert!(check_openable("/srv/edge.log", Some(10 * 1024 * 1024), &settings).is_ok());
    }

    #[tokio::test]
    async fn test_download_and_upload() {
        let mem = MemFs::new();
        mem.add_file("/srv/app.conf", b"listen 80;\n");
        let fs = RemoteFs::new(Arc::new(mem.clone()));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("nested").join("app.conf");

        let n = download(
            &fs,
            TransferJob::new(TransferDirection::Download),
            "/srv/app.conf",
            &local,
            &settings(),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(n, 11);
        assert_eq!(std::fs::read(&local).unwrap(), b"listen 80;\n");

        std::fs::write(&local, b"listen 8080;\n").unwrap();
        upload(
            &fs,
            TransferJob::new(TransferDirection::Upload),
            &local,
            "/srv/app.conf",
            &settings(),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(mem.file("/srv/app.conf").unwrap(), b"listen 8080;\n");
    }

    #[tokio::test]
    async fn test_open_rejects_before_network() {
        let connector = FakeConnector::new();
        connector.fs().add_file("/srv/release.jar", b"PK");
        let pool = ConnectionPool::new(connector.clone(), Default::default());
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let registry = OpenRegistry::new();

        let result = open_remote(
            &pool,
            &store,
            &registry,
            &test_config(),
            "/srv/release.jar",
            None,
            &TransferSettings::default(),
        )
        .await;

        assert!(matches!(result, Err(AppError::SizeOrTypeRejected(_))));

        let listed_size = Some(10 * 1024 * 1024 + 1);
        let result = open_remote(
            &pool,
            &store,
            &registry,
            &test_config(),
            "/srv/huge.log",
            listed_size,
            &TransferSettings::default(),
        )
        .await;
        assert!(matches!(result, Err(AppError::SizeOrTypeRejected(_))));

        assert_eq!(connector.connect_count(), 0);
        assert_eq!(connector.fs().calls(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_oversized_after_stat() {
        let connector = FakeConnector::new();
        connector.fs().add_file("/srv/big.log", &vec![b'x'; 64]);
        let pool = ConnectionPool::new(connector.clone(), Default::default());
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let registry = OpenRegistry::new();
        let settings = TransferSettings {
            max_open_bytes: 32,
            ..Default::default()
        };

        let result = open_remote(
            &pool,
            &store,
            &registry,
            &test_config(),
            "/srv/big.log",
            None,
            &settings,
        )
        .await;

        assert!(matches!(result, Err(AppError::SizeOrTypeRejected(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_open_and_save_back() {
        let connector = FakeConnector::new();
        connector.fs().add_file("/etc/motd", b"welcome\n");
        let pool = ConnectionPool::new(connector.clone(), Default::default());
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let registry = OpenRegistry::new();
        let config = test_config();

        let local = open_remote(
            &pool,
            &store,
            &registry,
            &config,
            "/etc/motd",
            Some(8),
            &settings(),
        )
        .await
        .unwrap();

        assert_eq!(
            local,
            dir.path().join("temp").join("_deploy_10.0.0.5_22").join("etc").join("motd")
        );
        assert_eq!(registry.get(&local).unwrap().remote_path, "/etc/motd");

        std::fs::write(&local, b"maintenance tonight\n").unwrap();
        save_back(&pool, &registry, &local, &settings()).await.unwrap();
        assert_eq!(connector.fs().file("/etc/motd").unwrap(), b"maintenance tonight\n");
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_save_back_unknown_file() {
        let pool = ConnectionPool::new(FakeConnector::new(), Default::default());
        let registry = OpenRegistry::new();
        let result = save_back(&pool, &registry, Path::new("/tmp/nope"), &settings()).await;
        assert!(result.is_err());
    }
}
