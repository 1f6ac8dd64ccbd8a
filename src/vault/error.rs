//! Error types for the credential vault

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Master secret must be exactly {expected} bytes (got {actual})")]
    InvalidMasterSecret { expected: usize, actual: usize },

    #[error("Encryption failed")]
    EncryptionFailed,

    /// Malformed blob, wrong owner key and tag mismatch all land here.
    #[error("Decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,
}
