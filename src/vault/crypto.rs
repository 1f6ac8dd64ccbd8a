//! AES-256-GCM encryption of per-owner secrets
//!
//! Blob layout (hex encoded, concatenated):
//!
//! ```text
//! iv (16 bytes) || tag (16 bytes) || ciphertext
//! ```
//!
//! The owner key is the first 32 hex characters of
//! `SHA-256(master_secret || owner_id)`, used as raw ASCII key bytes. This
//! keeps blobs written by earlier deployments readable.

use std::fmt;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::error::VaultError;
use crate::OwnerId;

/// Required master secret length in bytes
pub const MASTER_SECRET_LEN: usize = 32;

/// IV length in bytes
pub const IV_LEN: usize = 16;

/// Authentication tag length in bytes
pub const TAG_LEN: usize = 16;

const KEY_LEN: usize = 32;

/// AES-256-GCM with a 128-bit nonce
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Encrypts and decrypts secret material on behalf of owners
pub struct CredentialVault {
    master: Zeroizing<String>,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Create a vault from the master secret
    pub fn new(master_secret: &str) -> Result<Self, VaultError> {
        if master_secret.len() != MASTER_SECRET_LEN {
            return Err(VaultError::InvalidMasterSecret {
                expected: MASTER_SECRET_LEN,
                actual: master_secret.len(),
            });
        }
        Ok(Self {
            master: Zeroizing::new(master_secret.to_string()),
        })
    }

    /// Derive the symmetric key for one owner
    pub fn derive_key(&self, owner: OwnerId) -> Zeroizing<[u8; KEY_LEN]> {
        let mut hasher = Sha256::new();
        hasher.update(self.master.as_bytes());
        hasher.update(owner.to_string().as_bytes());
        let digest = Zeroizing::new(hex::encode(hasher.finalize()));

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&digest.as_bytes()[..KEY_LEN]);
        key
    }

    /// Encrypt `plaintext` for `owner`
    ///
    /// Returns `None` for empty plaintext: nothing is stored for absent secrets.
    pub fn encrypt(&self, plaintext: &str, owner: OwnerId) -> Result<Option<String>, VaultError> {
        if plaintext.is_empty() {
            return Ok(None);
        }

        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(owner);
        let cipher = Aes256Gcm16::new_from_slice(&*key).map_err(|_| VaultError::EncryptionFailed)?;

        let sealed = cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| VaultError::EncryptionFailed)?;

        // aes-gcm appends the tag to the ciphertext
        if sealed.len() < TAG_LEN {
            return Err(VaultError::EncryptionFailed);
        }
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut blob = String::with_capacity((IV_LEN + TAG_LEN + ciphertext.len()) * 2);
        blob.push_str(&hex::encode(iv));
        blob.push_str(&hex::encode(tag));
        blob.push_str(&hex::encode(ciphertext));
        Ok(Some(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt)
    ///
    /// The tag is verified before any plaintext is released.
    pub fn decrypt(&self, blob: &str, owner: OwnerId) -> Result<Zeroizing<String>, VaultError> {
        let iv_end = IV_LEN * 2;
        let tag_end = iv_end + TAG_LEN * 2;
        if blob.len() < tag_end || !blob.is_char_boundary(tag_end) {
            return Err(VaultError::DecryptionFailed);
        }

        let iv = hex::decode(&blob[..iv_end]).map_err(|_| VaultError::DecryptionFailed)?;
        let tag = hex::decode(&blob[iv_end..tag_end]).map_err(|_| VaultError::DecryptionFailed)?;
        let mut sealed =
            hex::decode(&blob[tag_end..]).map_err(|_| VaultError::DecryptionFailed)?;
        sealed.extend_from_slice(&tag);

        let key = self.derive_key(owner);
        let cipher =
            Aes256Gcm16::new_from_slice(&*key).map_err(|_| VaultError::DecryptionFailed)?;

        let plaintext = cipher
            .decrypt(Nonce::<U16>::from_slice(&iv), sealed.as_ref())
            .map_err(|_| VaultError::DecryptionFailed)?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|_| VaultError::DecryptionFailed)
    }

    /// Decrypt an optional stored secret
    ///
    /// `Ok(None)` means nothing was stored; a stored blob that fails to
    /// decrypt is an error, never `None`.
    pub fn open_secret(
        &self,
        blob: Option<&str>,
        owner: OwnerId,
    ) -> Result<Option<Zeroizing<String>>, VaultError> {
        match blob {
            None => Ok(None),
            Some(b) if b.is_empty() => Ok(None),
            Some(b) => self.decrypt(b, owner).map(Some),
        }
    }
}
