//! Local storage root for mirrored trees, opened files and records.
//!
//! Layout:
//! - `<root>/temp/<identifier><remote path>`: synced trees and opened files
//! - `<root>/<dir>/<name>`: records, such as recorded command output in `logs/`

use crate::error::{AppError, AppResult};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Write,
    Append,
}

/// Create every missing directory on the way to `path`, one segment at a time.
pub fn create_dir_chain(path: &Path) -> io::Result<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if matches!(component, Component::Prefix(_) | Component::RootDir | Component::CurDir) {
            continue;
        }
        match fs::create_dir(&current) {
            Ok(()) => tracing::trace!("Created directory {}", current.display()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && current.is_dir() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Only plain relative segments; no `..`, no roots
fn validate_relative(path: &str) -> AppResult<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let rel = Path::new(trimmed);
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(AppError::InvalidConfig(format!("Invalid storage path: {}", path)));
            }
        }
    }
    Ok(rel.to_path_buf())
}

/// Identifiers come from user-editable names; keep them to one path segment
fn sanitize_segment(segment: &str) -> AppResult<String> {
    let cleaned: String = segment
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(AppError::InvalidConfig(format!("Invalid storage name: {:?}", segment)));
    }
    Ok(cleaned)
}

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Local path mirroring `remote_path` for the connection named by `identifier`.
    pub fn mirror_path(&self, identifier: &str, remote_path: &str) -> AppResult<PathBuf> {
        let base = self.temp_dir().join(sanitize_segment(identifier)?);
        Ok(base.join(validate_relative(remote_path)?))
    }

    /// Create `<root>/<rel>` segment by segment and return it.
    pub fn ensure_dir_chain(&self, rel: &str) -> AppResult<PathBuf> {
        let path = self.root.join(validate_relative(rel)?);
        create_dir_chain(&path)?;
        Ok(path)
    }

    /// Write or append `<root>/<dir>/<name>`, creating `dir` first.
    pub fn record_file(
        &self,
        dir: &str,
        name: &str,
        content: &[u8],
        mode: FileMode,
    ) -> AppResult<PathBuf> {
        let dir = self.ensure_dir_chain(dir)?;
        let path = dir.join(sanitize_segment(name)?);
        write_file(&path, content, mode)?;
        Ok(path)
    }
}

fn write_file(path: &Path, content: &[u8], mode: FileMode) -> AppResult<()> {
    match mode {
        FileMode::Write => {
            // Write atomically using temp file
            let temp_path = path.with_extension("tmp");
            fs::write(&temp_path, content)?;
            fs::rename(&temp_path, path)?;
        }
        FileMode::Append => {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(content)?;
        }
    }
    tracing::debug!("Recorded {} bytes to {}", content.len(), path.display());
    Ok(())
}
