use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a pooled session: two configs with the same triple share one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    host: String,
    port: u16,
    username: String,
}

impl EndpointKey {
    pub fn new(host: &str, port: u16, username: &str) -> AppResult<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(AppError::InvalidConfig("Endpoint host must not be empty".to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.host, self.port, self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_host_rejected() {
        assert!(EndpointKey::new("", 22, "root").is_err());
        assert!(EndpointKey::new("   ", 22, "root").is_err());
    }

    #[test]
    fn test_display_matches_pool_key() {
        let key = EndpointKey::new("example.org", 2222, "deploy").unwrap();
        assert_eq!(key.to_string(), "example.org_2222_deploy");
    }
}
