//! Opening remote connections for owners

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::credentials::{resolve_server, QuickCredentials};
use crate::error::ProxyError;
use crate::remote::{self, RemoteConnection, RemoteConnector};
use crate::store::ServerStore;
use crate::vault::CredentialVault;
use crate::{OwnerId, ServerId};

/// Resolves credentials and connects under the configured timeouts
#[derive(Clone)]
pub struct Dialer {
    connector: Arc<dyn RemoteConnector>,
    store: Arc<dyn ServerStore>,
    vault: Arc<CredentialVault>,
    connect_timeout: Duration,
    test_timeout: Duration,
}

impl Dialer {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        store: Arc<dyn ServerStore>,
        vault: Arc<CredentialVault>,
        connect_timeout: Duration,
        test_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            store,
            vault,
            connect_timeout,
            test_timeout,
        }
    }

    /// Connect to a stored server owned by `owner`
    ///
    /// Unknown ids and other owners' ids both yield `NotFound`.
    pub async fn dial_server(
        &self,
        owner: OwnerId,
        server: ServerId,
    ) -> Result<Arc<dyn RemoteConnection>, ProxyError> {
        let record = self
            .store
            .find_server(owner, server)
            .await?
            .ok_or_else(|| {
                warn!("Owner {} requested unknown server {}", owner, server);
                ProxyError::NotFound
            })?;

        let config = resolve_server(&record, &self.vault, self.connect_timeout)?;
        let connection = remote::connect_with_timeout(&*self.connector, &config).await?;
        info!("Owner {} connected to server {} ({})", owner, server, record.host);
        Ok(connection)
    }

    /// Connect with inline credentials
    pub async fn dial_quick(
        &self,
        credentials: QuickCredentials,
    ) -> Result<Arc<dyn RemoteConnection>, ProxyError> {
        let config = credentials.into_ssh_config(self.connect_timeout)?;
        Ok(remote::connect_with_timeout(&*self.connector, &config).await?)
    }

    /// Connect, authenticate and disconnect under the test timeout
    pub async fn test_connection(&self, credentials: QuickCredentials) -> Result<(), ProxyError> {
        let config = credentials.into_ssh_config(self.test_timeout)?;
        remote::check_connection(&*self.connector, &config, self.test_timeout).await?;
        Ok(())
    }
}
