//! SSH connection errors
//!
//! `Display` text ends up in `ssh-error` events, so it stays short.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    /// TCP connect or key exchange failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Opening a channel, PTY, shell or subsystem failed
    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    /// Stored private key could not be parsed or decrypted
    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The connection's owner task is gone
    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_russh_errors_become_protocol_errors() {
        let err: SshError = russh::Error::Disconnect.into();
        assert!(matches!(err, SshError::ProtocolError(_)));
        assert!(err.to_string().starts_with("SSH protocol error: "));
    }
}
