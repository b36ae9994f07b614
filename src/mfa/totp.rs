//! TOTP (Time-based One-Time Password) support.

use async_trait::async_trait;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::clock::{SharedClock, system_clock};
use crate::error::{PacekeeperError, Result};

/// Configuration for TOTP generation.
#[derive(Clone, Debug)]
pub struct TotpConfig {
    /// Issuer name shown in authenticator apps (e.g., "MyApp").
    pub issuer: String,
    /// Number of digits in the code (default: 6).
    pub digits: usize,
    /// Time step in seconds (default: 30).
    pub step: u64,
    /// Algorithm (default: SHA1 for compatibility).
    pub algorithm: Algorithm,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: "Pacekeeper".to_string(),
            digits: 6,
            step: 30,
            algorithm: Algorithm::SHA1,
        }
    }
}

impl TotpConfig {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            ..Default::default()
        }
    }
}

/// Data returned when enrolling a user.
#[derive(Debug, Clone)]
pub struct TotpSetup {
    /// Base32-encoded secret to store.
    pub secret: String,
    /// `otpauth://` URI for authenticator apps.
    pub uri: String,
}

/// Lookup of a user's enrolled TOTP secret.
#[async_trait]
pub trait TotpSecretStore: Send + Sync {
    /// Base32 secret, or `None` if the user has no TOTP enrolled.
    async fn get_totp_secret(&self, user_id: &str) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct TotpManager {
    config: TotpConfig,
    clock: SharedClock,
}

// Codes do not depend on the label; only provisioning URIs show it.
const CODE_ONLY_LABEL: &str = "pacekeeper";

impl TotpManager {
    pub fn new(config: TotpConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Generate a secret and provisioning URI for a user.
    ///
    /// `account_name` is the label shown in the authenticator app and must
    /// not contain `:`.
    pub fn generate_setup(&self, account_name: &str) -> Result<TotpSetup> {
        if account_name.contains(':') {
            return Err(PacekeeperError::bad_request(
                "TOTP account name must not contain ':'",
            ));
        }
        let secret = Secret::generate_secret().to_encoded().to_string();
        let uri = self.build_totp(&secret, account_name)?.get_url();
        Ok(TotpSetup { secret, uri })
    }

    /// Verify a code at the clock's current time.
    ///
    /// One step of skew is tolerated either side.
    pub fn verify(&self, secret: &str, code: &str) -> Result<bool> {
        let now = self.clock.now().timestamp().max(0) as u64;
        self.verify_at(secret, code, now)
    }

    pub fn verify_at(&self, secret: &str, code: &str, time: u64) -> Result<bool> {
        let totp = self.build_totp(secret, CODE_ONLY_LABEL)?;
        // Users paste codes as "123 456" or "123-456"
        let code = code.replace([' ', '-'], "");
        Ok(totp.check(&code, time))
    }

    /// The code valid at `time`.
    pub fn generate_at(&self, secret: &str, time: u64) -> Result<String> {
        Ok(self.build_totp(secret, CODE_ONLY_LABEL)?.generate(time))
    }

    fn build_totp(&self, secret: &str, account_name: &str) -> Result<TOTP> {
        TOTP::new(
            self.config.algorithm,
            self.config.digits,
            1,
            self.config.step,
            Secret::Encoded(secret.to_string())
                .to_bytes()
                .map_err(|e| PacekeeperError::internal(format!("Invalid TOTP secret: {}", e)))?,
            Some(self.config.issuer.clone()),
            account_name.to_string(),
        )
        .map_err(|e| PacekeeperError::internal(format!("Failed to create TOTP: {}", e)))
    }
}
