//! SFTP session over an existing SSH connection

use std::path::Path;

use async_trait::async_trait;
use russh_sftp::protocol::FileAttributes;
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::types::FileType;
use crate::remote::{RemoteAttrs, RemoteDirEntry, RemoteFs};
use crate::ssh::HandleController;

/// The SFTP subsystem of one SSH connection
pub struct SftpFileSystem {
    sftp: RusshSftpSession,
    /// Connection id, for logs
    connection_id: String,
}

impl SftpFileSystem {
    /// Open a channel on the connection and start the SFTP subsystem on it
    pub async fn open(
        controller: &HandleController,
        connection_id: &str,
    ) -> Result<Self, SftpError> {
        info!("Opening SFTP subsystem for connection {}", connection_id);

        let channel = controller
            .open_session_channel()
            .await
            .map_err(|e| SftpError::ChannelError(e.to_string()))?;

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotAvailable(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;

        info!("SFTP subsystem opened for connection {}", connection_id);

        Ok(Self {
            sftp,
            connection_id: connection_id.to_string(),
        })
    }
}

fn attrs_from_metadata(metadata: &FileAttributes) -> RemoteAttrs {
    RemoteAttrs {
        file_type: metadata.permissions.map(FileType::from_mode).unwrap_or(FileType::File),
        size: metadata.size.unwrap_or(0),
        mtime: metadata.mtime.map(|t| t as i64).unwrap_or(0),
        permissions: metadata.permissions,
        uid: metadata.uid.unwrap_or(0),
        gid: metadata.gid.unwrap_or(0),
    }
}

#[async_trait]
impl RemoteFs for SftpFileSystem {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError> {
        debug!("Listing directory: {}", path);

        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;

        let entries: Vec<RemoteDirEntry> = read_dir
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| RemoteDirEntry {
                attrs: attrs_from_metadata(&entry.metadata()),
                name: entry.file_name(),
            })
            .collect();

        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, SftpError> {
        let metadata = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        Ok(attrs_from_metadata(&metadata))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        debug!("Reading file: {}", path);
        self.sftp
            .read(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<u64, SftpError> {
        let mut local_file = tokio::fs::File::open(local).await?;

        let mut remote_file = self
            .sftp
            .create(remote)
            .await
            .map_err(|e| SftpError::from_remote(e, remote))?;

        let written = tokio::io::copy(&mut local_file, &mut remote_file)
            .await
            .map_err(|e| SftpError::WriteError(format!("Failed to upload {}: {}", remote, e)))?;

        remote_file
            .shutdown()
            .await
            .map_err(|e| SftpError::WriteError(format!("Failed to close {}: {}", remote, e)))?;

        info!("Uploaded {} bytes to {}", written, remote);
        Ok(written)
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<u64, SftpError> {
        let mut remote_file = self
            .sftp
            .open(remote)
            .await
            .map_err(|e| SftpError::from_remote(e, remote))?;

        let mut local_file = tokio::fs::File::create(local).await?;

        let read = tokio::io::copy(&mut remote_file, &mut local_file)
            .await
            .map_err(|e| SftpError::ProtocolError(e.to_string()))?;
        local_file.flush().await?;

        info!("Downloaded {} bytes from {}", read, remote);
        Ok(read)
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        info!("Creating directory: {}", path);
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        info!("Removing directory: {}", path);
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        info!("Deleting: {}", path);
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        info!("Renaming {} to {}", from, to);
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| SftpError::from_remote(e, from))
    }

    async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            warn!(
                "Failed to close SFTP subsystem for connection {}: {}",
                self.connection_id, e
            );
        }
    }
}
