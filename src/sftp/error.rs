//! SFTP error types

use serde::Serialize;
use thiserror::Error;

/// SFTP operation errors
#[derive(Debug, Error)]
pub enum SftpError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotAvailable(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SFTP protocol error: {0}")]
    ProtocolError(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SftpError {
    /// Map a russh-sftp failure on `path` to a specific variant
    pub fn from_remote(err: impl std::fmt::Display, path: &str) -> Self {
        let err_str = err.to_string();
        if err_str.contains("No such file") || err_str.contains("not found") {
            SftpError::FileNotFound(path.to_string())
        } else if err_str.contains("Permission denied") {
            SftpError::PermissionDenied(path.to_string())
        } else {
            SftpError::ProtocolError(err_str)
        }
    }
}

impl Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
