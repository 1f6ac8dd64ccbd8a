//! Handle Owner Task
//!
//! Only one task owns the russh `Handle<ClientHandler>`. Shells and SFTP
//! sessions reach it through a cloneable `HandleController` that sends
//! commands over an mpsc channel, so the handle is never locked across
//! `.await`.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, connection_id);
//! let channel = controller.open_session_channel().await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether the transport died on its own
const TRANSPORT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for PTY/shell or SFTP)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Create a controller from an existing sender (tests drive the receiver)
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller. The task ends on
/// `Disconnect`, when every controller is dropped, or when the transport
/// dies underneath it.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    connection_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;

        info!("Handle owner task started for connection {}", connection_id);

        let mut transport_check = tokio::time::interval(TRANSPORT_CHECK_INTERVAL);

        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => cmd,
                _ = transport_check.tick() => {
                    if handle.is_closed() {
                        warn!("Transport closed for connection {}", connection_id);
                        break;
                    }
                    continue;
                }
            };

            match cmd {
                Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    let transport_gone = matches!(&result, Err(russh::Error::Disconnect));
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                    if transport_gone || handle.is_closed() {
                        warn!("Transport closed for connection {}", connection_id);
                        break;
                    }
                }
                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for connection {}", connection_id);
                    break;
                }
                None => {
                    info!("All controllers dropped for connection {}", connection_id);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        debug!("Handle owner task terminated for connection {}", connection_id);
    });

    HandleController { cmd_tx }
}

/// Drain all pending commands, returning Disconnected to each caller
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    // Close first so is_connected() flips and no new commands arrive
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
