//! SSH connection and interactive shell pump

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::SshError;
use super::handle_owner::HandleController;
use crate::registry::ManagedHandle;
use crate::remote::{
    PtySize, RemoteConnection, RemoteFs, ShellChannel, ShellCommand, ShellOutput,
};
use crate::sftp::{SftpError, SftpFileSystem};

/// An authenticated SSH connection
///
/// Holds a `HandleController`; the russh handle itself lives in the owner task.
pub struct SshConnection {
    id: String,
    /// `user@host:port`, for logs
    target: String,
    controller: HandleController,
    closed: AtomicBool,
}

impl SshConnection {
    pub fn new(id: String, target: String, controller: HandleController) -> Self {
        Self {
            id,
            target,
            controller,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ManagedHandle for SshConnection {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.controller.is_connected()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closing SSH connection {} ({})", self.id, self.target);
            self.controller.disconnect().await;
        }
    }
}

#[async_trait]
impl RemoteConnection for SshConnection {
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, SshError> {
        let channel = self.controller.open_session_channel().await?;

        debug!("Channel opened on {}, requesting PTY", self.id);

        channel
            .request_pty(
                false,
                "xterm-256color",
                size.cols,
                size.rows,
                size.pixel_width,
                size.pixel_height,
                &[],
            )
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        info!(
            "Interactive shell started on {} ({}x{})",
            self.id, size.cols, size.rows
        );

        let (shell, cmd_rx, out_tx) = ShellChannel::pair();
        tokio::spawn(run_shell_pump(channel, cmd_rx, out_tx, self.id.clone()));
        Ok(shell)
    }

    async fn open_file_transfer(&self) -> Result<Arc<dyn RemoteFs>, SftpError> {
        let fs = SftpFileSystem::open(&self.controller, &self.id).await?;
        Ok(Arc::new(fs))
    }
}

/// Move bytes between one SSH channel and its `ShellChannel`
///
/// Ends on a local `Close` (or the command sender dropping), on remote
/// EOF/close, or when the channel disappears with the connection. Exactly one
/// terminal event (`Closed` or `Error`) is sent for remote-side endings.
async fn run_shell_pump(
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    out_tx: mpsc::Sender<ShellOutput>,
    id: String,
) {
    debug!("Shell pump started for {}", id);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ShellCommand::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            error!("Failed to send data to SSH channel on {}: {}", id, e);
                            let _ = out_tx.send(ShellOutput::Error(e.to_string())).await;
                            break;
                        }
                    }
                    Some(ShellCommand::Resize(size)) => {
                        if let Err(e) = channel
                            .window_change(size.cols, size.rows, size.pixel_width, size.pixel_height)
                            .await
                        {
                            // Not fatal; the shell keeps its old geometry
                            error!("Failed to resize PTY on {}: {}", id, e);
                        } else {
                            debug!("PTY resized to {}x{} on {}", size.cols, size.rows, id);
                        }
                    }
                    Some(ShellCommand::Close) | None => {
                        info!("Shell close requested on {}", id);
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        break;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if out_tx.send(ShellOutput::Data(Bytes::copy_from_slice(&data))).await.is_err() {
                            debug!("Shell consumer gone on {}", id);
                            let _ = channel.close().await;
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // stderr goes to the same terminal
                        if ext == 1
                            && out_tx.send(ShellOutput::Data(Bytes::copy_from_slice(&data))).await.is_err()
                        {
                            let _ = channel.close().await;
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                        info!("SSH channel closed by remote on {}", id);
                        let _ = out_tx.send(ShellOutput::Closed).await;
                        break;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("Shell exit status {} on {}", exit_status, id);
                    }
                    Some(_) => {}
                    None => {
                        info!("SSH channel lost on {}", id);
                        let _ = out_tx
                            .send(ShellOutput::Error("SSH connection lost".to_string()))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    debug!("Shell pump terminated for {}", id);
}
