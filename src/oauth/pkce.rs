//! PKCE (RFC 7636) checks. Only the `S256` method is accepted.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

use crate::crypto::constant_time_eq;
use crate::error::{PacekeeperError, Result};

pub const PKCE_METHOD_S256: &str = "S256";

const MIN_LENGTH: usize = 43;
const MAX_LENGTH: usize = 128;

fn check_format(value: &str, field: &str) -> Result<()> {
    if !(MIN_LENGTH..=MAX_LENGTH).contains(&value.len()) {
        return Err(PacekeeperError::bad_request(format!(
            "{} must be {}-{} characters",
            field, MIN_LENGTH, MAX_LENGTH
        )));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(PacekeeperError::bad_request(format!(
            "{} must be valid base64url",
            field
        )));
    }
    Ok(())
}

fn check_method(method: &str) -> Result<()> {
    if method != PKCE_METHOD_S256 {
        return Err(PacekeeperError::bad_request(
            "code_challenge_method must be S256",
        ));
    }
    Ok(())
}

/// Validate a challenge before it is stored.
pub fn validate_code_challenge(code_challenge: &str, method: &str) -> Result<()> {
    check_method(method)?;
    check_format(code_challenge, "code_challenge")
}

/// `base64url_nopad(sha256(verifier))`
pub fn compute_code_challenge(code_verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()))
}

/// Check a verifier against a stored challenge.
///
/// Malformed input is a `BadRequest`; a well-formed verifier that does not
/// match returns `Ok(false)`.
pub fn verify_code_verifier(code_verifier: &str, code_challenge: &str, method: &str) -> Result<bool> {
    check_method(method)?;
    check_format(code_verifier, "code_verifier")?;
    Ok(constant_time_eq(
        &compute_code_challenge(code_verifier),
        code_challenge,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 Appendix B
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn test_rfc_vector() {
        assert_eq!(compute_code_challenge(VERIFIER), CHALLENGE);
        assert!(verify_code_verifier(VERIFIER, CHALLENGE, "S256").unwrap());
    }

    #[test]
    fn test_wrong_verifier() {
        let other = "x".repeat(43);
        assert!(!verify_code_verifier(&other, CHALLENGE, "S256").unwrap());
    }

    #[test]
    fn test_plain_method_rejected() {
        assert!(validate_code_challenge(CHALLENGE, "plain").is_err());
        assert!(verify_code_verifier(VERIFIER, CHALLENGE, "plain").is_err());
    }

    #[test]
    fn test_challenge_format() {
        assert!(validate_code_challenge(CHALLENGE, "S256").is_ok());
        assert!(validate_code_challenge("short", "S256").is_err());
        assert!(validate_code_challenge(&"a".repeat(129), "S256").is_err());
        let padded = format!("{}=", &CHALLENGE[..42]);
        assert!(validate_code_challenge(&padded, "S256").is_err());
    }

    #[test]
    fn test_verifier_format() {
        assert!(verify_code_verifier("too-short", CHALLENGE, "S256").is_err());
        let bad_chars = format!("{}+/", "a".repeat(41));
        assert!(verify_code_verifier(&bad_chars, CHALLENGE, "S256").is_err());
    }
}
