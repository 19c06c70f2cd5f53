use crate::error::{AppError, AppResult};
use crate::ssh::EndpointKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A saved SSH connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to a private key file on disk
    #[serde(default, rename = "private", skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    /// Key material loaded in memory; never written to disk
    #[serde(skip)]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithms: Option<Algorithms>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Algorithms {
    #[serde(default)]
    pub cipher: Vec<String>,
}

fn default_port() -> u16 {
    22
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            name: None,
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: None,
            private_key_path: None,
            private_key: None,
            passphrase: None,
            algorithms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `username@host:port`, the key this connection is saved under
    pub fn connection_id(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Used to name the local directory that mirrors this connection
    pub fn identifier(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.name.as_deref().unwrap_or_default(),
            self.username,
            self.host,
            self.port
        )
    }

    pub fn endpoint_key(&self) -> AppResult<EndpointKey> {
        EndpointKey::new(&self.host, self.port, &self.username)
    }

    /// Storage key for the forwards declared against this endpoint
    pub fn forward_store_key(&self) -> String {
        format!("{}_{}", self.host, self.port)
    }

    pub fn ciphers(&self) -> &[String] {
        self.algorithms
            .as_ref()
            .map(|a| a.cipher.as_slice())
            .unwrap_or_default()
    }

    /// Check the fields a connection needs before it is saved.
    pub fn validate(&self) -> AppResult<()> {
        if self.port == 0 {
            return Err(AppError::InvalidConfig("You must input port!".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(AppError::InvalidConfig("You must input host!".to_string()));
        }
        let has_secret = self.password.as_deref().map_or(false, |p| !p.is_empty())
            || self.private_key_path.is_some()
            || self.private_key.is_some();
        if !has_secret {
            return Err(AppError::InvalidConfig("You must input password!".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(AppError::InvalidConfig("You must input username!".to_string()));
        }
        Ok(())
    }

    /// Read the private key file into memory unless it is already loaded.
    pub fn load_private_key(&mut self) -> AppResult<()> {
        if self.private_key.is_some() {
            return Ok(());
        }
        if let Some(path) = &self.private_key_path {
            let key = std::fs::read_to_string(path).map_err(|e| {
                AppError::Auth(format!("Failed to read private key {}: {}", path.display(), e))
            })?;
            self.private_key = Some(key);
        }
        Ok(())
    }
}

/// connections.toml format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionsFile {
    #[serde(default)]
    pub connections: BTreeMap<String, SshConfig>,
}

/// Saved connections, keyed by connection id
pub struct ConnectionStore {
    connections: BTreeMap<String, SshConfig>,
    config_path: PathBuf,
}

impl ConnectionStore {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("connections.toml");
        let connections = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let file: ConnectionsFile = toml::from_str(&content)?;
            file.connections
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            connections,
            config_path,
        })
    }

    pub fn save(&self) -> AppResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = ConnectionsFile {
            connections: self.connections.clone(),
        };
        let content = toml::to_string_pretty(&file)?;
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<SshConfig> {
        self.connections.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<SshConfig> {
        self.connections.get(id).cloned()
    }

    /// Look up by connection id, or by name when no id matches.
    pub fn find(&self, id_or_name: &str) -> AppResult<SshConfig> {
        if let Some(config) = self.get(id_or_name) {
            return Ok(config);
        }
        self.connections
            .values()
            .find(|c| c.name.as_deref() == Some(id_or_name))
            .cloned()
            .ok_or_else(|| AppError::ConnectionNotFound(id_or_name.to_string()))
    }

    /// Insert or replace a connection under its id.
    pub fn upsert(&mut self, config: SshConfig) -> AppResult<String> {
        config.validate()?;
        let id = config.connection_id();
        let mut config = config;
        config.updated_at = chrono::Utc::now().timestamp();
        self.connections.insert(id.clone(), config);
        self.save()?;
        Ok(id)
    }

    pub fn delete(&mut self, id: &str) -> AppResult<SshConfig> {
        let removed = self
            .connections
            .remove(id)
            .ok_or_else(|| AppError::ConnectionNotFound(id.to_string()))?;
        self.save()?;
        Ok(removed)
    }

    /// Merge imported connections, overwriting entries with the same id.
    pub fn merge(&mut self, imported: Vec<SshConfig>) -> AppResult<usize> {
        let mut count = 0;
        for config in imported {
            self.connections.insert(config.connection_id(), config);
            count += 1;
        }
        self.save()?;
        Ok(count)
    }
}

/// Parse an OpenSSH client config into connections.
pub fn parse_openssh_config(content: &str) -> Vec<SshConfig> {
    let mut parsed = Vec::new();
    let mut current: Option<SshConfig> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
        if parts.len() != 2 {
            continue;
        }

        let key = parts[0].to_lowercase();
        let value = parts[1].trim();

        match key.as_str() {
            "host" => {
                if let Some(config) = current.take() {
                    parsed.push(config);
                }
                let mut config = SshConfig::new(String::new(), String::new());
                config.name = Some(value.to_string());
                current = Some(config);
            }
            "hostname" => {
                if let Some(ref mut config) = current {
                    config.host = value.to_string();
                }
            }
            "user" => {
                if let Some(ref mut config) = current {
                    config.username = value.to_string();
                }
            }
            "port" => {
                if let Some(ref mut config) = current {
                    if let Ok(port) = value.parse() {
                        config.port = port;
                    }
                }
            }
            "identityfile" => {
                if let Some(ref mut config) = current {
                    config.private_key_path = Some(PathBuf::from(expand_home(value)));
                }
            }
            "ciphers" => {
                if let Some(ref mut config) = current {
                    config.algorithms = Some(Algorithms {
                        cipher: value
                            .split(',')
                            .map(|c| c.trim().to_string())
                            .filter(|c| !c.is_empty())
                            .collect(),
                    });
                }
            }
            _ => {}
        }
    }

    if let Some(config) = current {
        parsed.push(config);
    }

    // Host blocks without a HostName fall back to the alias itself
    parsed
        .into_iter()
        .map(|mut c| {
            if c.host.is_empty() {
                c.host = c.name.clone().unwrap_or_default();
            }
            c
        })
        .filter(|c| !c.host.is_empty() && !c.host.contains('*') && !c.host.contains('?'))
        .collect()
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().to_string(),
        _ => path.to_string(),
    }
}

/// Export connections to OpenSSH config format. Passwords are never exported.
pub fn export_openssh_config(connections: &[SshConfig]) -> String {
    let mut output = String::new();
    output.push_str("# Generated by sshdock\n\n");

    for config in connections {
        let alias = config
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| config.host.clone());
        output.push_str(&format!("Host {}\n", alias));
        output.push_str(&format!("    HostName {}\n", config.host));
        output.push_str(&format!("    User {}\n", config.username));
        if config.port != 22 {
            output.push_str(&format!("    Port {}\n", config.port));
        }
        if let Some(path) = &config.private_key_path {
            output.push_str(&format!("    IdentityFile {}\n", path.display()));
        }
        if !config.ciphers().is_empty() {
            output.push_str(&format!("    Ciphers {}\n", config.ciphers().join(",")));
        }
        output.push('\n');
    }

    output
}
