//! Proxy boundary errors
//!
//! Every lower-level error is translated into one of these kinds before it
//! reaches a browser. The `Display` text is the short message users see.

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::sftp::SftpError;
use crate::ssh::SshError;
use crate::store::StoreError;
use crate::vault::VaultError;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Unauthenticated(String),

    /// Unknown server or a server owned by someone else; the two are
    /// indistinguishable on purpose
    #[error("Server not found")]
    NotFound,

    #[error("{0}")]
    Connect(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Failed to decrypt stored credentials")]
    Decryption,

    /// A single remote operation failed; the session stays usable
    #[error("{0}")]
    Remote(String),

    #[error("SFTP session expired or does not exist, please reconnect")]
    SessionExpired,

    #[error("SFTP connection lost, please reconnect")]
    SessionDisconnected,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Message safe to show to the user
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Short kind label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config",
            ProxyError::Unauthenticated(_) => "authentication",
            ProxyError::NotFound => "authorization",
            ProxyError::Connect(_) | ProxyError::Timeout => "connect",
            ProxyError::Decryption => "decryption",
            ProxyError::Remote(_)
            | ProxyError::SessionExpired
            | ProxyError::SessionDisconnected => "remote",
            ProxyError::InvalidRequest(_) => "request",
            ProxyError::Internal(_) => "internal",
        }
    }
}

impl From<SshError> for ProxyError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::Timeout(_) => ProxyError::Timeout,
            other => ProxyError::Connect(other.to_string()),
        }
    }
}

impl From<SftpError> for ProxyError {
    fn from(err: SftpError) -> Self {
        ProxyError::Remote(err.to_string())
    }
}

impl From<VaultError> for ProxyError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::InvalidMasterSecret { .. } => ProxyError::Config(err.to_string()),
            _ => ProxyError::Decryption,
        }
    }
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        ProxyError::Internal(err.to_string())
    }
}

impl From<AuthError> for ProxyError {
    fn from(err: AuthError) -> Self {
        ProxyError::Unauthenticated(err.to_string())
    }
}

impl From<ConfigError> for ProxyError {
    fn from(err: ConfigError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl serde::Serialize for ProxyError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.user_message())
    }
}
