use serde::Serialize;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Peer reset the connection. Fails the operation but is never shown to the user.
    #[error("Connection reset: {0}")]
    TransientReset(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("This forward already exists: {0}")]
    DuplicateForward(String),

    #[error("Refusing to open {0}")]
    SizeOrTypeRejected(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Transfer cancelled: {0}")]
    Cancelled(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Forward not found: {0}")]
    ForwardNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl AppError {
    /// Build an error from a transport failure message, recognising peer resets.
    pub fn transport(context: &str, err: impl std::fmt::Display) -> Self {
        let msg = format!("{}: {}", context, err);
        if is_reset_message(&msg) {
            AppError::TransientReset(msg)
        } else {
            AppError::Ssh(msg)
        }
    }

    /// Like [`AppError::transport`] but for a failed remote file operation.
    pub fn protocol(context: &str, err: impl std::fmt::Display) -> Self {
        let msg = format!("{}: {}", context, err);
        if is_reset_message(&msg) {
            AppError::TransientReset(msg)
        } else {
            AppError::Protocol(msg)
        }
    }

    /// Whether this error should reach user-facing notifications.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, AppError::TransientReset(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Ssh(_) => "SSH_ERROR",
            AppError::Connection(_) => "CONNECTION_ERROR",
            AppError::Auth(_) => "AUTH_ERROR",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::TransientReset(_) => "TRANSIENT_RESET",
            AppError::Protocol(_) => "PROTOCOL_ERROR",
            AppError::DuplicateForward(_) => "DUPLICATE_FORWARD",
            AppError::SizeOrTypeRejected(_) => "SIZE_OR_TYPE_REJECTED",
            AppError::Tunnel(_) => "TUNNEL_ERROR",
            AppError::Cancelled(_) => "CANCELLED",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            AppError::ForwardNotFound(_) => "FORWARD_NOT_FOUND",
            AppError::InvalidConfig(_) => "INVALID_CONFIG",
            AppError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }
}

/// ECONNRESET and friends, as reported by libssh2 or the OS.
pub fn is_reset_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("econnreset")
        || lower.contains("connection reset")
        || lower.contains("reset by peer")
}

/// Serializable error for the CLI's JSON output
#[derive(Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (message, details) = match err {
            AppError::Auth(msg) => ("Authentication failed".to_string(), Some(msg.clone())),
            AppError::DuplicateForward(id) => (
                "This forward already exists".to_string(),
                Some(id.clone()),
            ),
            AppError::ConnectionNotFound(id) => (format!("Connection {} not found", id), None),
            AppError::ForwardNotFound(id) => (format!("Forward {} not found", id), None),
            AppError::Io(e) => (e.to_string(), None),
            AppError::Ssh(msg)
            | AppError::Connection(msg)
            | AppError::Timeout(msg)
            | AppError::TransientReset(msg)
            | AppError::Protocol(msg)
            | AppError::SizeOrTypeRejected(msg)
            | AppError::Tunnel(msg)
            | AppError::Cancelled(msg)
            | AppError::Config(msg)
            | AppError::Serialization(msg)
            | AppError::InvalidConfig(msg)
            | AppError::Unknown(msg) => (msg.clone(), None),
        };

        SerializableError {
            code: err.code().to_string(),
            message,
            details,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Unknown(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Unknown(format!("Background task failed: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_is_hidden() {
        let err = AppError::transport("read failed", "read ECONNRESET");
        assert!(matches!(err, AppError::TransientReset(_)));
        assert!(!err.is_user_visible());
    }

    #[test]
    fn test_other_transport_errors_are_visible() {
        let err = AppError::transport("exec failed", "channel closed");
        assert!(matches!(err, AppError::Ssh(_)));
        assert!(err.is_user_visible());
    }

    #[test]
    fn test_serialized_codes() {
        let err = AppError::DuplicateForward("h_22_127.0.0.1_8080_db_5432".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "DUPLICATE_FORWARD");
        assert_eq!(json["message"], "This forward already exists");
    }
}
