use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_command")]
    pub probe_command: String,
    /// Seconds between keepalives; 0 disables them
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    #[serde(default = "default_true")]
    pub use_agent: bool,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_probe_command() -> String {
    "echo \"ping\"".to_string()
}

fn default_keepalive() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            probe_command: default_probe_command(),
            keepalive_interval: default_keepalive(),
            use_agent: true,
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_max_open_bytes")]
    pub max_open_bytes: u64,
    #[serde(default = "default_denied_extensions")]
    pub denied_extensions: Vec<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_progress_interval() -> u64 {
    100
}

fn default_max_open_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_denied_extensions() -> Vec<String> {
    ["gz", "exe", "7z", "jar", "bin", "tar"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_chunk_size() -> usize {
    32 * 1024
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval(),
            max_open_bytes: default_max_open_bytes(),
            denied_extensions: default_denied_extensions(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl TransferSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root for synced trees, opened files and records. Defaults to the data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

impl AppSettings {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: AppSettings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let settings = AppSettings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn storage_root(&self) -> AppResult<PathBuf> {
        match &self.storage.root {
            Some(root) => Ok(root.clone()),
            None => super::get_data_dir(),
        }
    }
}
