//! SSH Configuration

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::config::DEFAULT_CONNECT_TIMEOUT_SECS;

/// SSH connection configuration
///
/// Built per connection attempt from a decrypted server record or from
/// inline credentials, and dropped right after.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connect + authenticate timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl SshConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
            timeout_secs: default_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Authentication methods supported
#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// PEM/OpenSSH encoded private key
        private_key: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            private_key: private_key.into(),
            passphrase,
        }
    }
}

// Secrets never reach logs
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password { .. }"),
            AuthMethod::Key { passphrase, .. } => f
                .debug_struct("Key")
                .field("has_passphrase", &passphrase.is_some())
                .finish_non_exhaustive(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
