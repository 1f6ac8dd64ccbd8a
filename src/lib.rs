//! webssh-proxy - remote session proxy for a browser SSH manager
//!
//! Bridges browser transports to remote shells and file transfer, keeping
//! a registry of live connections per owner and server and decrypting
//! stored credentials on demand.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod credentials;
pub mod dialer;
pub mod error;
pub mod registry;
pub mod remote;
pub mod sftp;
pub mod ssh;
pub mod store;
pub mod terminal;
pub mod vault;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use auth::JwtVerifier;
use config::ProxyConfig;
use credentials::QuickCredentials;
use dialer::Dialer;
use error::ProxyError;
use remote::RemoteConnector;
use sftp::FileTransferProxy;
use ssh::RusshConnector;
use store::{JsonServerStore, MemoryServerStore, ServerStore};
use terminal::TerminalProxy;
use vault::CredentialVault;

/// Owner (user) identifier
pub type OwnerId = i64;
/// Stored server identifier
pub type ServerId = i64;

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Everything a running proxy shares between transports
pub struct ProxyState {
    pub config: ProxyConfig,
    pub terminal: Arc<TerminalProxy>,
    pub files: Arc<FileTransferProxy>,
    dialer: Dialer,
}

impl ProxyState {
    /// Build the production state: russh connector and the configured store
    pub async fn from_config(config: ProxyConfig) -> Result<Self, ProxyError> {
        let store: Arc<dyn ServerStore> = match &config.server_store_path {
            Some(path) => {
                let store = JsonServerStore::load(path).await?;
                info!("Loaded {} server records from {:?}", store.len(), path);
                Arc::new(store)
            }
            None => {
                info!("No server store configured, starting with an empty one");
                Arc::new(MemoryServerStore::new())
            }
        };

        tokio::fs::create_dir_all(&config.transfer_temp_dir)
            .await
            .map_err(|e| {
                ProxyError::Config(format!(
                    "Cannot create transfer directory {:?}: {}",
                    config.transfer_temp_dir, e
                ))
            })?;

        Self::with_parts(config, Arc::new(RusshConnector), store)
    }

    /// Build the state around explicit collaborators
    pub fn with_parts(
        config: ProxyConfig,
        connector: Arc<dyn RemoteConnector>,
        store: Arc<dyn ServerStore>,
    ) -> Result<Self, ProxyError> {
        let vault = Arc::new(CredentialVault::new(&config.master_secret)?);
        let dialer = Dialer::new(
            connector,
            store,
            vault,
            config.connect_timeout(),
            config.test_timeout(),
        );

        let terminal = Arc::new(TerminalProxy::new(
            dialer.clone(),
            Arc::new(JwtVerifier::new(&config.jwt_secret)),
            config.registry.clone(),
        ));
        let files = Arc::new(FileTransferProxy::new(
            dialer.clone(),
            config.registry.clone(),
            config.transfer_temp_dir.clone(),
        ));

        info!(
            "Proxy state ready (idle timeout {}s, connect timeout {}s)",
            config.registry.idle_timeout_secs, config.connect_timeout_secs
        );

        Ok(Self {
            config,
            terminal,
            files,
            dialer,
        })
    }

    /// Connect with inline credentials, authenticate and disconnect
    pub async fn test_connection(&self, credentials: QuickCredentials) -> Result<(), ProxyError> {
        self.dialer.test_connection(credentials).await
    }

    /// Close every registered connection
    pub async fn shutdown(&self) {
        info!("Shutting down, releasing all sessions");
        self.terminal.shutdown().await;
        self.files.shutdown().await;
    }
}
