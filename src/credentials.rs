//! Turning stored or inline credentials into an [`SshConfig`]
//!
//! Decrypted secrets only live inside the returned config, which callers drop
//! as soon as the connection attempt finishes.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ProxyError;
use crate::ssh::{AuthMethod, SshConfig};
use crate::store::{AuthKind, ServerRecord};
use crate::vault::CredentialVault;

/// Used when a request or record leaves the port unset (0)
const DEFAULT_SSH_PORT: u16 = 22;

/// Credentials supplied with a quick connect or a connectivity test
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickCredentials {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for QuickCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl QuickCredentials {
    /// Build a config, preferring the password over the key
    pub fn into_ssh_config(self, timeout: Duration) -> Result<SshConfig, ProxyError> {
        if self.host.trim().is_empty() || self.username.trim().is_empty() {
            return Err(ProxyError::InvalidRequest(
                "Host and username are required".to_string(),
            ));
        }

        let port = match self.port {
            Some(0) | None => DEFAULT_SSH_PORT,
            Some(port) => port,
        };

        let auth = match (self.password, self.private_key) {
            (Some(password), _) if !password.is_empty() => AuthMethod::password(password),
            (_, Some(key)) if !key.is_empty() => AuthMethod::key(key, self.passphrase),
            _ => {
                return Err(ProxyError::InvalidRequest(
                    "Password or private key is required".to_string(),
                ))
            }
        };

        Ok(SshConfig::new(self.host, port, self.username, auth).with_timeout(timeout))
    }
}

/// Decrypt a stored record's secret under its owner's key
///
/// A blob that fails to decrypt aborts the connect; it is never treated as
/// an empty credential.
pub fn resolve_server(
    record: &ServerRecord,
    vault: &CredentialVault,
    timeout: Duration,
) -> Result<SshConfig, ProxyError> {
    let auth = match record.auth_kind {
        AuthKind::Password => {
            let password = vault
                .open_secret(record.password_encrypted.as_deref(), record.owner_id)
                .map_err(|e| {
                    warn!("Failed to decrypt password for server {}: {}", record.id, e);
                    ProxyError::from(e)
                })?
                .ok_or_else(|| {
                    ProxyError::InvalidRequest("No password stored for this server".to_string())
                })?;
            AuthMethod::password(password.as_str())
        }
        AuthKind::Key => {
            let key = vault
                .open_secret(record.private_key_encrypted.as_deref(), record.owner_id)
                .map_err(|e| {
                    warn!("Failed to decrypt private key for server {}: {}", record.id, e);
                    ProxyError::from(e)
                })?
                .ok_or_else(|| {
                    ProxyError::InvalidRequest(
                        "No private key stored for this server".to_string(),
                    )
                })?;
            AuthMethod::key(key.as_str(), None)
        }
    };

    let port = if record.port == 0 { DEFAULT_SSH_PORT } else { record.port };

    Ok(
        SshConfig::new(record.host.clone(), port, record.username.clone(), auth)
            .with_timeout(timeout),
    )
}
