//! Identity verification for realtime connections
//!
//! Tokens are issued by the auth service; this side only checks them and
//! turns a valid access token into a [`UserId`].

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{config::JwtConfig, models::UserId, Error, Result};

/// Supplies a verified identity for a credential
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserId>;
}

/// JWT claims issued by the auth service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Token type ("access" or "refresh")
    #[serde(rename = "type")]
    pub typ: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 access-token verifier
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
    token_type: String,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &[u8], token_type: impl Into<String>) -> Self {
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            validation: Validation::new(Algorithm::HS256),
            token_type: token_type.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &JwtConfig) -> Self {
        Self::new(config.secret.as_bytes(), config.access_token_type.clone())
    }

    /// Decode and validate a token, returning its claims
    pub fn verify_claims(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| Error::Authentication(format!("Invalid token: {e}")))?;

        if data.claims.typ != self.token_type {
            return Err(Error::Authentication(format!(
                "Expected {} token, got {}",
                self.token_type, data.claims.typ
            )));
        }

        Ok(data.claims)
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserId> {
        let claims = self.verify_claims(token)?;
        claims
            .sub
            .parse()
            .map_err(|_| Error::Authentication(format!("Malformed subject: {}", claims.sub)))
    }
}
