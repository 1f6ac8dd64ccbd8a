//! Remote file-transfer proxy
//!
//! File operations against registry-managed SFTP sessions. Stored servers
//! connect on first use and are reused by their owner; quick sessions are
//! reachable only through the id handed out at connect time.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tempfile::TempPath;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::SftpError;
use super::path_utils::remote_file_name;
use super::types::{build_listing, FileInfo, FileType};
use crate::credentials::QuickCredentials;
use crate::dialer::Dialer;
use crate::error::ProxyError;
use crate::registry::{
    ManagedHandle, RegistryConfig, RegistryEntry, RegistryStats, SessionKey, SessionRegistry,
};
use crate::remote::{RemoteConnection, RemoteFs};
use crate::{OwnerId, ServerId};

/// Directory listed right after connecting
const HOME_DIR: &str = ".";

/// A connection together with its open SFTP subsystem
pub struct FileSession {
    connection: Arc<dyn RemoteConnection>,
    fs: Arc<dyn RemoteFs>,
}

impl FileSession {
    /// Start the file-transfer subsystem; the connection is closed on failure
    pub async fn open(connection: Arc<dyn RemoteConnection>) -> Result<Self, ProxyError> {
        match connection.open_file_transfer().await {
            Ok(fs) => Ok(Self { connection, fs }),
            Err(e) => {
                warn!("Failed to open SFTP subsystem: {}", e);
                connection.close().await;
                Err(e.into())
            }
        }
    }

    pub fn fs(&self) -> &dyn RemoteFs {
        &*self.fs
    }
}

#[async_trait]
impl ManagedHandle for FileSession {
    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn close(&self) {
        self.fs.close().await;
        self.connection.close().await;
    }
}

/// Which session a file operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTarget {
    /// Stored server, connected on demand
    Server(ServerId),
    /// Quick session id returned by [`FileTransferProxy::connect_quick`]
    Quick(Uuid),
}

impl FileTarget {
    fn key(self, owner: OwnerId) -> SessionKey {
        match self {
            FileTarget::Server(server) => SessionKey::bound(owner, server),
            FileTarget::Quick(token) => SessionKey::AdHoc { owner, token },
        }
    }
}

/// Result of a quick connect
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickSession {
    pub session_id: Uuid,
    pub files: Vec<FileInfo>,
}

/// A remote file staged locally for streaming to the client
///
/// The staged file is removed when this value is dropped.
#[derive(Debug)]
pub struct DownloadedFile {
    pub file_name: String,
    pub size: u64,
    path: TempPath,
}

impl DownloadedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct FileTransferProxy {
    registry: SessionRegistry<FileSession>,
    dialer: Dialer,
    staging_dir: PathBuf,
}

impl FileTransferProxy {
    pub fn new(dialer: Dialer, registry: RegistryConfig, staging_dir: PathBuf) -> Self {
        Self {
            registry: SessionRegistry::new(registry),
            dialer,
            staging_dir,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub async fn stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    /// Close every session (shutdown)
    pub async fn shutdown(&self) {
        self.registry.release_all().await;
    }

    /// Connect (or reuse) a stored server and list its home directory
    pub async fn connect_server(
        &self,
        owner: OwnerId,
        server: ServerId,
    ) -> Result<Vec<FileInfo>, ProxyError> {
        self.list_directory(owner, FileTarget::Server(server), HOME_DIR)
            .await
    }

    /// Connect with inline credentials under a fresh session id
    pub async fn connect_quick(
        &self,
        owner: OwnerId,
        credentials: QuickCredentials,
    ) -> Result<QuickSession, ProxyError> {
        let session_id = Uuid::new_v4();
        let key = FileTarget::Quick(session_id).key(owner);

        self.registry
            .acquire(&key, || async {
                let connection = self.dialer.dial_quick(credentials).await?;
                FileSession::open(connection).await.map(Arc::new)
            })
            .await?;

        info!("Quick SFTP session {} opened for owner {}", session_id, owner);

        match self
            .list_directory(owner, FileTarget::Quick(session_id), HOME_DIR)
            .await
        {
            Ok(files) => Ok(QuickSession { session_id, files }),
            Err(e) => {
                self.registry.release(&key).await;
                Err(e)
            }
        }
    }

    /// Close a session. Idempotent.
    pub async fn disconnect(&self, owner: OwnerId, target: FileTarget) -> bool {
        self.registry.release(&target.key(owner)).await
    }

    pub async fn list_directory(
        &self,
        owner: OwnerId,
        target: FileTarget,
        path: &str,
    ) -> Result<Vec<FileInfo>, ProxyError> {
        let path = if path.is_empty() { HOME_DIR } else { path };
        let entries = self
            .with_session(owner, target, |s| async move { s.fs().read_dir(path).await })
            .await?;
        Ok(build_listing(path, entries))
    }

    pub async fn stat(
        &self,
        owner: OwnerId,
        target: FileTarget,
        path: &str,
    ) -> Result<FileInfo, ProxyError> {
        let path = require_path(path)?;
        let attrs = self
            .with_session(owner, target, |s| async move { s.fs().stat(path).await })
            .await?;

        let (dir, name) = match path.trim_end_matches('/').rsplit_once('/') {
            Some((dir, name)) => (if dir.is_empty() { "/" } else { dir }, name),
            None => (HOME_DIR, path),
        };
        Ok(FileInfo::from_attrs(dir, name.to_string(), &attrs))
    }

    /// Read a remote file as text; invalid UTF-8 is replaced
    pub async fn read_file(
        &self,
        owner: OwnerId,
        target: FileTarget,
        path: &str,
    ) -> Result<String, ProxyError> {
        let path = require_path(path)?;
        let bytes = self
            .with_session(owner, target, |s| async move { s.fs().read_file(path).await })
            .await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Overwrite a remote file with `content`, staged through a local temp file
    pub async fn write_file(
        &self,
        owner: OwnerId,
        target: FileTarget,
        path: &str,
        content: &str,
    ) -> Result<(), ProxyError> {
        let path = require_path(path)?;
        let staged = self.create_staging_file().await?;
        tokio::fs::write(&staged, content.as_bytes())
            .await
            .map_err(|e| ProxyError::Internal(format!("Failed to stage file: {}", e)))?;

        self.with_session(owner, target, |s| async move {
            s.fs().put_file(&staged, path).await
        })
        .await?;

        debug!("Saved {} bytes to {}", content.len(), path);
        Ok(())
    }

    pub async fn create_directory(
        &self,
        owner: OwnerId,
        target: FileTarget,
        path: &str,
    ) -> Result<(), ProxyError> {
        let path = require_path(path)?;
        self.with_session(owner, target, |s| async move { s.fs().create_dir(path).await })
            .await
    }

    pub async fn delete_file(
        &self,
        owner: OwnerId,
        target: FileTarget,
        path: &str,
    ) -> Result<(), ProxyError> {
        let path = require_path(path)?;
        self.with_session(owner, target, |s| async move { s.fs().remove_file(path).await })
            .await
    }

    /// Remove an empty directory
    pub async fn delete_directory(
        &self,
        owner: OwnerId,
        target: FileTarget,
        path: &str,
    ) -> Result<(), ProxyError> {
        let path = require_path(path)?;
        self.with_session(owner, target, |s| async move { s.fs().remove_dir(path).await })
            .await
    }

    /// Delete by the type the client reports for `path`
    pub async fn delete(
        &self,
        owner: OwnerId,
        target: FileTarget,
        path: &str,
        file_type: FileType,
    ) -> Result<(), ProxyError> {
        match file_type {
            FileType::Directory => self.delete_directory(owner, target, path).await,
            FileType::File | FileType::Symlink => self.delete_file(owner, target, path).await,
        }
    }

    pub async fn rename(
        &self,
        owner: OwnerId,
        target: FileTarget,
        from: &str,
        to: &str,
    ) -> Result<(), ProxyError> {
        let from = require_path(from)?;
        let to = require_path(to)?;
        self.with_session(owner, target, |s| async move { s.fs().rename(from, to).await })
            .await
    }

    /// A fresh file in the staging directory for an incoming upload
    pub async fn create_staging_file(&self) -> Result<TempPath, ProxyError> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| ProxyError::Internal(format!("Failed to create staging dir: {}", e)))?;

        let file = tempfile::Builder::new()
            .prefix("transfer-")
            .tempfile_in(&self.staging_dir)
            .map_err(|e| ProxyError::Internal(format!("Failed to create staging file: {}", e)))?;
        Ok(file.into_temp_path())
    }

    /// Upload a staged file; the staged copy is removed whatever the outcome
    pub async fn upload(
        &self,
        owner: OwnerId,
        target: FileTarget,
        staged: TempPath,
        remote_path: &str,
    ) -> Result<u64, ProxyError> {
        let remote_path = require_path(remote_path)?;
        self.with_session(owner, target, |s| async move {
            s.fs().put_file(&staged, remote_path).await
        })
        .await
    }

    /// Download a remote file into the staging directory
    pub async fn download(
        &self,
        owner: OwnerId,
        target: FileTarget,
        remote_path: &str,
    ) -> Result<DownloadedFile, ProxyError> {
        let remote_path = require_path(remote_path)?;
        let staged = self.create_staging_file().await?;

        let size = self
            .with_session(owner, target, |s| {
                let local = staged.to_path_buf();
                async move { s.fs().get_file(remote_path, &local).await }
            })
            .await?;

        Ok(DownloadedFile {
            file_name: remote_file_name(remote_path).to_string(),
            size,
            path: staged,
        })
    }

    /// Resolve the session for `target`
    async fn session(
        &self,
        owner: OwnerId,
        target: FileTarget,
    ) -> Result<Arc<RegistryEntry<FileSession>>, ProxyError> {
        let key = target.key(owner);
        match target {
            FileTarget::Server(server) => {
                self.registry
                    .acquire(&key, || async {
                        let connection = self.dialer.dial_server(owner, server).await?;
                        FileSession::open(connection).await.map(Arc::new)
                    })
                    .await
            }
            FileTarget::Quick(_) => match self.registry.peek(&key).await {
                None => Err(ProxyError::SessionExpired),
                Some(entry) if !entry.handle().is_connected() => {
                    self.registry.release_entry(&entry).await;
                    Err(ProxyError::SessionDisconnected)
                }
                Some(entry) => {
                    entry.touch();
                    Ok(entry)
                }
            },
        }
    }

    /// Run one operation on the session, holding it open meanwhile
    ///
    /// A failure that left the connection dead also drops the session, so
    /// the next call reconnects (stored servers) or reports it (quick).
    async fn with_session<T, F, Fut>(
        &self,
        owner: OwnerId,
        target: FileTarget,
        op: F,
    ) -> Result<T, ProxyError>
    where
        F: FnOnce(Arc<FileSession>) -> Fut,
        Fut: Future<Output = Result<T, SftpError>>,
    {
        let entry = self.session(owner, target).await?;
        let lease = entry.lease();
        let session = lease.handle();

        let result = op(session.clone()).await;
        drop(lease);

        if let Err(e) = &result {
            if !session.is_connected() {
                warn!("Session {} lost during operation: {}", entry.key(), e);
                self.registry.release_entry(&entry).await;
            }
        }
        result.map_err(ProxyError::from)
    }
}

fn require_path(path: &str) -> Result<&str, ProxyError> {
    if path.is_empty() {
        Err(ProxyError::InvalidRequest("Path is required".to_string()))
    } else {
        Ok(path)
    }
}
