//! Transport token verification
//!
//! The login API issues HS256 tokens carrying the owner id in `userId`. The
//! terminal proxy only verifies them.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::OwnerId;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication failed")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),

    #[error("Authentication failed: token expired")]
    Expired,

    #[error("Not authenticated")]
    Missing,
}

/// Claims issued by the login API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: OwnerId,
    pub exp: u64,
}

/// Resolves a bearer token to an owner id
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<OwnerId, AuthError>;
}

/// HS256 verifier keyed by the shared JWT secret
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<OwnerId, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims.user_id)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e),
            })
    }
}
