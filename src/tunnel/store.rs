use super::ForwardDescriptor;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// forwards.toml format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardsFile {
    /// `<host>_<port>` to the forwards declared against that endpoint
    #[serde(default)]
    pub forwards: BTreeMap<String, Vec<ForwardDescriptor>>,
}

/// Persisted forward definitions, grouped per endpoint in declaration order
pub struct ForwardStore {
    forwards: BTreeMap<String, Vec<ForwardDescriptor>>,
    path: PathBuf,
}

impl ForwardStore {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let path = config_dir.join("forwards.toml");
        let forwards = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: ForwardsFile = toml::from_str(&content)?;
            file.forwards
        } else {
            BTreeMap::new()
        };
        Ok(Self { forwards, path })
    }

    pub fn save(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = ForwardsFile {
            forwards: self.forwards.clone(),
        };
        std::fs::write(&self.path, toml::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn list(&self, key: &str) -> Vec<ForwardDescriptor> {
        self.forwards.get(key).cloned().unwrap_or_default()
    }

    pub fn find(&self, key: &str, id: &str) -> Option<ForwardDescriptor> {
        self.forwards
            .get(key)
            .and_then(|list| list.iter().find(|f| f.id == id))
            .cloned()
    }

    pub fn contains(&self, key: &str, id: &str) -> bool {
        self.find(key, id).is_some()
    }

    /// Append a descriptor and save. Identical ids are rejected.
    pub fn add(&mut self, key: &str, descriptor: ForwardDescriptor) -> AppResult<()> {
        if self.contains(key, &descriptor.id) {
            return Err(AppError::DuplicateForward(descriptor.id));
        }
        let mut stored = descriptor;
        stored.active = false;
        self.forwards.entry(key.to_string()).or_default().push(stored);
        self.save()
    }

    pub fn remove(&mut self, key: &str, id: &str) -> AppResult<ForwardDescriptor> {
        let list = self
            .forwards
            .get_mut(key)
            .ok_or_else(|| AppError::ForwardNotFound(id.to_string()))?;
        let index = list
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| AppError::ForwardNotFound(id.to_string()))?;
        let removed = list.remove(index);
        if list.is_empty() {
            self.forwards.remove(key);
        }
        self.save()?;
        Ok(removed)
    }
}
