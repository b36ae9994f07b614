//! Refresh-token cookie for web clients.
//!
//! Web clients keep the refresh token in an httpOnly cookie; access and CSRF
//! tokens travel in the response body. Mobile clients never get the cookie.

use chrono::{DateTime, Utc};
use cookie::{Cookie, SameSite};

use super::ClientType;
use crate::config::SecurityConfig;

/// Builds and clears the refresh-token cookie.
#[derive(Debug, Clone)]
pub struct RefreshCookie {
    pub name: String,
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
}

impl Default for RefreshCookie {
    fn default() -> Self {
        Self {
            name: "refresh_token".to_string(),
            path: "/".to_string(),
            domain: None,
            secure: true,
        }
    }
}

impl RefreshCookie {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            secure: config.secure_cookies,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Cookie carrying `refresh_token` until `expires_at`.
    ///
    /// Returns `None` for mobile clients.
    pub fn build(
        &self,
        client_type: ClientType,
        refresh_token: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Option<Cookie<'static>> {
        if client_type != ClientType::Web {
            return None;
        }
        let max_age = (expires_at - now).num_seconds().max(0);
        Some(
            self.base(refresh_token.to_string())
                .max_age(cookie::time::Duration::seconds(max_age))
                .build(),
        )
    }

    /// Cookie that removes the refresh token from the browser.
    pub fn removal(&self) -> Cookie<'static> {
        self.base(String::new())
            .max_age(cookie::time::Duration::ZERO)
            .build()
    }

    fn base(&self, value: String) -> cookie::CookieBuilder<'static> {
        let mut builder = Cookie::build((self.name.clone(), value))
            .path(self.path.clone())
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Strict);
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_web_cookie_attributes() {
        let now = Utc::now();
        let cookie = RefreshCookie::default()
            .build(ClientType::Web, "tok", now, now + Duration::days(7))
            .unwrap();

        assert_eq!(cookie.name(), "refresh_token");
        assert_eq!(cookie.value(), "tok");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::days(7)));
    }

    #[test]
    fn test_mobile_gets_no_cookie() {
        let now = Utc::now();
        assert!(
            RefreshCookie::default()
                .build(ClientType::Mobile, "tok", now, now + Duration::days(7))
                .is_none()
        );
    }

    #[test]
    fn test_removal_cookie() {
        let cookie = RefreshCookie::new("rt").domain("example.com").removal();
        assert_eq!(cookie.name(), "rt");
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(cookie::time::Duration::ZERO));
        assert_eq!(cookie.domain(), Some("example.com"));
    }

    #[test]
    fn test_from_config_respects_secure_flag() {
        let mut config = SecurityConfig::default();
        config.secure_cookies = false;
        let now = Utc::now();
        let cookie = RefreshCookie::from_config(&config)
            .build(ClientType::Web, "tok", now, now + Duration::hours(1))
            .unwrap();
        assert_eq!(cookie.secure(), Some(false));
    }
}
