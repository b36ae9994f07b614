/// Get environment variable with PACEKEEPER_ prefix, falling back to unprefixed version
///
/// Checks `PACEKEEPER_{key}` first, then `{key}`.
///
/// # Examples
///
/// ```rust,ignore
/// use crate::utils::get_env_with_prefix;
///
/// // Checks PACEKEEPER_SECRET_KEY first, then SECRET_KEY
/// let secret = get_env_with_prefix("SECRET_KEY");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("PACEKEEPER_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Get and parse a prefixed environment variable.
///
/// Unparseable values are logged and treated as unset.
pub fn get_env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = get_env_with_prefix(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("PACEKEEPER_ENV_TEST_VAR", "prefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("ENV_TEST_VAR"),
            Some("prefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("PACEKEEPER_ENV_TEST_VAR");
        }

        unsafe {
            std::env::set_var("ENV_FALLBACK_VAR", "unprefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("ENV_FALLBACK_VAR"),
            Some("unprefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("ENV_FALLBACK_VAR");
        }

        assert_eq!(get_env_with_prefix("ENV_NON_EXISTENT_VAR"), None);
    }

    #[test]
    fn test_get_env_parsed() {
        unsafe {
            std::env::set_var("PACEKEEPER_ENV_PARSED_OK", "42");
            std::env::set_var("PACEKEEPER_ENV_PARSED_BAD", "forty-two");
        }
        assert_eq!(get_env_parsed::<u64>("ENV_PARSED_OK"), Some(42));
        assert_eq!(get_env_parsed::<u64>("ENV_PARSED_BAD"), None);
        unsafe {
            std::env::remove_var("PACEKEEPER_ENV_PARSED_OK");
            std::env::remove_var("PACEKEEPER_ENV_PARSED_BAD");
        }
    }
}
