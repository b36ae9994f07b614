//! Utility functions and helpers.
//!
//! Environment variable handling, input truncation and expiry arithmetic
//! used across stores.

pub mod env;

use chrono::{DateTime, Duration, Utc};

use crate::error::{PacekeeperError, Result};

pub use env::{get_env_parsed, get_env_with_prefix};

/// Maximum stored IP address length (IPv6 textual max).
pub const MAX_IP_LENGTH: usize = 45;

/// Maximum stored user agent length.
pub const MAX_USER_AGENT_LENGTH: usize = 512;

/// Truncate a string to at most `max_len` characters.
pub fn truncate_chars(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

/// Truncate a client-supplied IP address before it is persisted.
pub fn truncate_ip(ip: &str) -> String {
    truncate_chars(ip, MAX_IP_LENGTH)
}

/// Shorten a secret identifier for log output.
pub(crate) fn log_prefix(id: &str) -> String {
    truncate_chars(id, 8)
}

/// `now + ttl`, or a `Config` error when the result is past chrono's range.
pub(crate) fn expires_after(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(ttl).ok_or_else(|| {
        PacekeeperError::config(format!("TTL of {}s is out of range", ttl.num_seconds()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ip() {
        assert_eq!(truncate_ip("127.0.0.1"), "127.0.0.1");
        let long = "a".repeat(100);
        assert_eq!(truncate_ip(&long).len(), MAX_IP_LENGTH);
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate_chars("ééééé", 2), "éé");
    }

    #[test]
    fn test_log_prefix() {
        assert_eq!(log_prefix("abcdefghijklmnop"), "abcdefgh");
        assert_eq!(log_prefix("abc"), "abc");
    }

    #[test]
    fn test_expires_after_out_of_range() {
        let now = Utc::now();
        assert_eq!(expires_after(now, Duration::hours(1)).unwrap(), now + Duration::hours(1));

        let err = expires_after(now, Duration::days(1_000_000_000)).unwrap_err();
        assert!(matches!(err, PacekeeperError::Config(_)));
    }
}
