//! Keyed hashing and generation of high-entropy tokens.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::SecurityConfig;
use crate::error::{PacekeeperError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Random bytes behind every generated token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Generate a secure random token, URL-safe base64 without padding.
pub fn generate_secure_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time string comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Deterministic keyed hash for bearer secrets.
///
/// Refresh and CSRF tokens are stored as `hex(HMAC-SHA256(server_secret, token))`.
/// The same token always hashes to the same value, which is what allows an
/// exact lookup of a superseded token. Without the server secret the stored
/// values cannot be reversed or recomputed.
#[derive(Clone)]
pub struct TokenHasher {
    key: SecretString,
}

impl std::fmt::Debug for TokenHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenHasher").finish_non_exhaustive()
    }
}

impl TokenHasher {
    /// Create a hasher keyed with the server secret.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the secret is empty.
    pub fn new(secret: SecretString) -> Result<Self> {
        if secret.expose_secret().is_empty() {
            return Err(PacekeeperError::config(
                "Token hashing requires a non-empty server secret",
            ));
        }
        Ok(Self { key: secret })
    }

    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        Self::new(config.secret_key.clone())
    }

    /// Hash a raw token.
    pub fn hash(&self, token: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|e| PacekeeperError::internal(format!("Invalid HMAC key: {}", e)))?;
        mac.update(token.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a raw token against a stored hash in constant time.
    pub fn verify(&self, token: &str, expected_hash: &str) -> Result<bool> {
        let computed = self.hash(token)?;
        Ok(constant_time_eq(&computed, expected_hash))
    }
}
