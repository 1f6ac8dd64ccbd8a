//! Credential Vault
//!
//! Per-owner encryption of server secrets at rest. Keys are derived from the
//! master secret and the owner id on every call and never stored.

mod crypto;
mod error;

pub use crypto::{CredentialVault, IV_LEN, MASTER_SECRET_LEN, TAG_LEN};
pub use error::VaultError;
