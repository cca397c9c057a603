//! Request credentials: per-request bearer signing and basic-auth material.

use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Issues a fresh bearer credential for every outbound request.
pub trait TokenSigner: Send + Sync {
    /// `None` when no credential can be produced; the request still carries
    /// the auth header, with an empty token value.
    fn sign(&self) -> Option<String>;
}

/// Signer that never produces a token (unauthenticated deployments, tests).
pub struct NoSigner;

impl TokenSigner for NoSigner {
    fn sign(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub iss: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

/// HS256 signer over a shared secret. Tokens are short-lived and minted per
/// request, never cached.
pub struct JwtSigner {
    key: EncodingKey,
    issuer: String,
    audience: String,
    ttl_secs: u64,
}

impl JwtSigner {
    pub const DEFAULT_TTL_SECS: u64 = 300;

    pub fn new(secret: &[u8], issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            issuer: issuer.into(),
            audience: audience.into(),
            ttl_secs: Self::DEFAULT_TTL_SECS,
        }
    }

    /// Load the shared secret from a file. Raw bytes, no trimming; the
    /// secret is binary material, not a text credential.
    pub fn from_secret_file(
        path: &Path,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> std::io::Result<Self> {
        let secret = std::fs::read(path)?;
        Ok(Self::new(&secret, issuer, audience))
    }
}

impl TokenSigner for JwtSigner {
    fn sign(&self) -> Option<String> {
        let now = jsonwebtoken::get_current_timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&Header::default(), &claims, &self.key).ok()
    }
}

/// Read one basic-auth credential file, trimming the trailing CR/LF that
/// editors and provisioning tools leave behind.
pub fn read_credential(path: &Path) -> std::io::Result<String> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw.trim_end_matches(['\r', '\n']).to_string())
}
