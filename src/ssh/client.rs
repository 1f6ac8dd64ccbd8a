//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, info};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::session::SshConnection;
use crate::remote::{RemoteConnection, RemoteConnector};

/// Opens one authenticated SSH connection
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect, authenticate and hand the handle to its owner task
    pub async fn connect(self) -> Result<SshConnection, SshError> {
        let addr = (self.config.host.as_str(), self.config.port);

        info!(
            "Connecting to SSH server at {}:{}",
            self.config.host, self.config.port
        );

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(self.config.host.clone(), self.config.port);

        let mut handle = tokio::time::timeout(
            self.config.timeout(),
            client::connect(Arc::new(ssh_config), addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timeout".to_string()))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                private_key,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!(
            "SSH authentication successful for {}@{}:{}",
            self.config.username, self.config.host, self.config.port
        );

        let connection_id = uuid::Uuid::new_v4().to_string();
        let controller = spawn_handle_owner_task(handle, connection_id.clone());

        Ok(SshConnection::new(
            connection_id,
            format!("{}@{}:{}", self.config.username, self.config.host, self.config.port),
            controller,
        ))
    }
}

/// [`RemoteConnector`] backed by russh
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

#[async_trait]
impl RemoteConnector for RusshConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteConnection>, SshError> {
        let connection = SshClient::new(config.clone()).connect().await?;
        Ok(Arc::new(connection))
    }
}

/// Client handler for russh callbacks
///
/// Every server key is accepted; the SHA-256 fingerprint goes to the log.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Host key for {}:{} is {}",
            self.host,
            self.port,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}
