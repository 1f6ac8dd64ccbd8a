//! Process configuration
//!
//! Everything is read from the environment once at startup. A missing or
//! malformed master secret is fatal: the proxy refuses to start rather than
//! run with credentials it cannot decrypt.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::RegistryConfig;
use crate::vault::MASTER_SECRET_LEN;

pub const ENV_MASTER_SECRET: &str = "ENCRYPTION_KEY";
pub const ENV_JWT_SECRET: &str = "JWT_SECRET";
pub const ENV_BIND_ADDRESS: &str = "BIND_ADDRESS";
pub const ENV_IDLE_TIMEOUT: &str = "SESSION_IDLE_TIMEOUT_SECS";
pub const ENV_CONNECT_TIMEOUT: &str = "SSH_CONNECT_TIMEOUT_SECS";
pub const ENV_TEST_TIMEOUT: &str = "SSH_TEST_TIMEOUT_SECS";
pub const ENV_TEMP_DIR: &str = "TRANSFER_TEMP_DIR";
pub const ENV_SERVER_STORE: &str = "SERVER_STORE_PATH";

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:3001";

/// Real connects give up after 20 seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;

/// Connectivity tests give up after 10 seconds.
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 10;

/// Configuration errors (fatal at startup)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("ENCRYPTION_KEY must be exactly 32 bytes (got {0})")]
    InvalidMasterSecret(usize),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Proxy configuration
#[derive(Clone)]
pub struct ProxyConfig {
    /// Master secret feeding the credential vault
    pub master_secret: String,
    /// HMAC secret for transport tokens
    pub jwt_secret: String,
    /// WebSocket listen address
    pub bind_address: String,
    /// Session registry settings
    pub registry: RegistryConfig,
    pub connect_timeout_secs: u64,
    pub test_timeout_secs: u64,
    /// Directory where uploads/downloads are staged
    pub transfer_temp_dir: PathBuf,
    /// JSON file holding server records, if any
    pub server_store_path: Option<PathBuf>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("master_secret", &"<redacted>")
            .field("jwt_secret", &"<redacted>")
            .field("bind_address", &self.bind_address)
            .field("registry", &self.registry)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("test_timeout_secs", &self.test_timeout_secs)
            .field("transfer_temp_dir", &self.transfer_temp_dir)
            .field("server_store_path", &self.server_store_path)
            .finish()
    }
}

impl ProxyConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let master_secret = lookup(ENV_MASTER_SECRET)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(ENV_MASTER_SECRET))?;
        if master_secret.len() != MASTER_SECRET_LEN {
            return Err(ConfigError::InvalidMasterSecret(master_secret.len()));
        }

        let jwt_secret = lookup(ENV_JWT_SECRET)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(ENV_JWT_SECRET))?;

        let bind_address =
            lookup(ENV_BIND_ADDRESS).unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let mut registry = RegistryConfig::default();
        if let Some(secs) = parse_secs(&lookup, ENV_IDLE_TIMEOUT)? {
            registry.idle_timeout_secs = secs;
        }

        let connect_timeout_secs =
            parse_secs(&lookup, ENV_CONNECT_TIMEOUT)?.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        let test_timeout_secs =
            parse_secs(&lookup, ENV_TEST_TIMEOUT)?.unwrap_or(DEFAULT_TEST_TIMEOUT_SECS);

        let transfer_temp_dir = lookup(ENV_TEMP_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("webssh-proxy"));

        let server_store_path = lookup(ENV_SERVER_STORE)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            master_secret,
            jwt_secret,
            bind_address,
            registry,
            connect_timeout_secs,
            test_timeout_secs,
            transfer_temp_dir,
            server_store_path,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

/// Parse an optional positive number of seconds
fn parse_secs<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Some(secs)),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(vars: &HashMap<String, String>) -> Result<ProxyConfig, ConfigError> {
        ProxyConfig::from_lookup(|k| vars.get(k).cloned())
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_defaults() {
        let vars = env(&[(ENV_MASTER_SECRET, SECRET), (ENV_JWT_SECRET, "jwt")]);
        let config = load(&vars).unwrap();

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.registry.idle_timeout_secs, 600);
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
        assert_eq!(config.test_timeout(), Duration::from_secs(10));
        assert!(config.server_store_path.is_none());
    }

    #[test]
    fn test_missing_master_secret_is_fatal() {
        let vars = env(&[(ENV_JWT_SECRET, "jwt")]);
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Missing(ENV_MASTER_SECRET))
        ));
    }

    #[test]
    fn test_master_secret_length_enforced() {
        let vars = env(&[(ENV_MASTER_SECRET, "too-short"), (ENV_JWT_SECRET, "jwt")]);
        assert!(matches!(
            load(&vars),
            Err(ConfigError::InvalidMasterSecret(9))
        ));
    }

    #[test]
    fn test_timeout_overrides() {
        let vars = env(&[
            (ENV_MASTER_SECRET, SECRET),
            (ENV_JWT_SECRET, "jwt"),
            (ENV_IDLE_TIMEOUT, "30"),
            (ENV_CONNECT_TIMEOUT, "5"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.registry.idle_timeout_secs, 30);
        assert_eq!(config.connect_timeout_secs, 5);

        let bad = env(&[
            (ENV_MASTER_SECRET, SECRET),
            (ENV_JWT_SECRET, "jwt"),
            (ENV_IDLE_TIMEOUT, "soon"),
        ]);
        assert!(matches!(load(&bad), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let vars = env(&[(ENV_MASTER_SECRET, SECRET), (ENV_JWT_SECRET, "jwt-secret")]);
        let rendered = format!("{:?}", load(&vars).unwrap());
        assert!(!rendered.contains(SECRET));
        assert!(!rendered.contains("jwt-secret"));
    }
}
