//! Remote access capabilities
//!
//! The proxies only talk to remote hosts through these traits. The russh
//! implementation lives in [`crate::ssh`] and [`crate::sftp::session`]; tests
//! substitute in-memory fakes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::registry::ManagedHandle;
use crate::sftp::{FileType, SftpError};
use crate::ssh::{SshConfig, SshError};

/// Buffer between a shell pump and its consumer
pub const SHELL_CHANNEL_CAPACITY: usize = 1024;

/// PTY geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
    #[serde(default)]
    pub pixel_width: u32,
    #[serde(default)]
    pub pixel_height: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Commands accepted by an open shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// Bytes for the remote stdin
    Data(Vec<u8>),
    /// Resize the PTY
    Resize(PtySize),
    /// Close the shell
    Close,
}

/// Events produced by an open shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    /// Remote stdout/stderr bytes, in order
    Data(Bytes),
    /// The remote side closed the stream
    Closed,
    /// The connection failed underneath the shell
    Error(String),
}

/// Both directions of an interactive shell
#[derive(Debug)]
pub struct ShellChannel {
    pub input: mpsc::Sender<ShellCommand>,
    pub output: mpsc::Receiver<ShellOutput>,
}

impl ShellChannel {
    /// Create a shell channel and the pump-side ends
    pub fn pair() -> (Self, mpsc::Receiver<ShellCommand>, mpsc::Sender<ShellOutput>) {
        let (input, cmd_rx) = mpsc::channel(SHELL_CHANNEL_CAPACITY);
        let (out_tx, output) = mpsc::channel(SHELL_CHANNEL_CAPACITY);
        (Self { input, output }, cmd_rx, out_tx)
    }
}

/// Attributes of a remote file as reported by the file-transfer subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAttrs {
    pub file_type: FileType,
    pub size: u64,
    /// Modification time (Unix seconds)
    pub mtime: i64,
    /// Mode bits, if the server reported them
    pub permissions: Option<u32>,
    pub uid: u32,
    pub gid: u32,
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub name: String,
    pub attrs: RemoteAttrs,
}

/// File-transfer subsystem of one connection
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SftpError>;

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, SftpError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError>;

    /// Upload a local file in one transfer, returning bytes written
    async fn put_file(&self, local: &Path, remote: &str) -> Result<u64, SftpError>;

    /// Download a remote file into a local path, returning bytes read
    async fn get_file(&self, remote: &str, local: &Path) -> Result<u64, SftpError>;

    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;

    async fn close(&self);
}

/// An authenticated remote connection
#[async_trait]
pub trait RemoteConnection: ManagedHandle {
    /// Open an interactive shell with a PTY of the given size
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, SshError>;

    /// Open the file-transfer subsystem
    async fn open_file_transfer(&self) -> Result<Arc<dyn RemoteFs>, SftpError>;
}

/// Factory for remote connections
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteConnection>, SshError>;
}

/// Connect under the config's timeout
///
/// Exceeding the timeout is terminal; nothing is retried.
pub async fn connect_with_timeout(
    connector: &dyn RemoteConnector,
    config: &SshConfig,
) -> Result<Arc<dyn RemoteConnection>, SshError> {
    let timeout = config.timeout();
    match tokio::time::timeout(timeout, connector.connect(config)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Connection to {}:{} timed out after {}s",
                config.host,
                config.port,
                timeout.as_secs()
            );
            Err(SshError::Timeout("Connection timeout".to_string()))
        }
    }
}

/// Check that `config` can connect and authenticate, then disconnect
pub async fn check_connection(
    connector: &dyn RemoteConnector,
    config: &SshConfig,
    timeout: Duration,
) -> Result<(), SshError> {
    let mut config = config.clone();
    config.timeout_secs = timeout.as_secs();

    let connection = connect_with_timeout(connector, &config).await?;
    connection.close().await;
    info!(
        "Connectivity test to {}@{}:{} succeeded",
        config.username, config.host, config.port
    );
    Ok(())
}
