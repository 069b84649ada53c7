use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DispatchError;

/// Flat key/value mapping fed to adapters and actions.
pub type Inputs = Map<String, Value>;

/// An authorization credential pair, e.g. `token abc123` -> (`token`, `abc123`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Authorization scheme (`token`, `Bearer`, ...), as sent by the caller.
    pub scheme: String,
    /// The credential itself.
    pub credentials: String,
}

impl Credentials {
    pub fn new(scheme: impl Into<String>, credentials: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            credentials: credentials.into(),
        }
    }

    /// Parses an `Authorization`-style header value.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Unauthorized` when the value has no scheme or
    /// no credentials part.
    pub fn parse(header: &str) -> Result<Self, DispatchError> {
        let mut parts = header.trim().splitn(2, char::is_whitespace);
        let scheme = parts.next().unwrap_or_default();
        let credentials = parts.next().map(str::trim).unwrap_or_default();
        if scheme.is_empty() || credentials.is_empty() {
            return Err(DispatchError::Unauthorized(
                "Authorization header is malformed".to_string(),
            ));
        }
        Ok(Self::new(scheme, credentials))
    }

    /// Case-insensitive scheme comparison.
    #[must_use]
    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
    }
}

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Identity the caller was authenticated as. Used as the rate-limit key.
    pub owner: String,
    /// Any further facts the authenticator resolved (roles, tenant, ...).
    #[serde(default)]
    pub claims: Map<String, Value>,
}

impl AuthInfo {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            claims: Map::new(),
        }
    }

    #[must_use]
    pub fn with_claim(mut self, key: impl Into<String>, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }
}

/// Resource acquisition policy for one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaoOptions {
    pub start_transaction: bool,
}

impl DaoOptions {
    #[must_use]
    pub fn transactional() -> Self {
        Self {
            start_transaction: true,
        }
    }
}

/// How an acquired DAO handle is given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Commit,
    Rollback,
}

impl Release {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

/// Rate limit for one endpoint: at most `limit` calls per `window` per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateOptions {
    pub window: Duration,
    pub limit: u32,
}

impl RateOptions {
    #[must_use]
    pub fn new(window: Duration, limit: u32) -> Self {
        Self { window, limit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_and_credentials() {
        let creds = Credentials::parse("token abc123").unwrap();
        assert_eq!(creds, Credentials::new("token", "abc123"));
    }

    #[test]
    fn parse_tolerates_surrounding_whitespace() {
        let creds = Credentials::parse("  Bearer   xyz  ").unwrap();
        assert_eq!(creds.scheme, "Bearer");
        assert_eq!(creds.credentials, "xyz");
        assert!(creds.has_scheme("bearer"));
    }

    #[test]
    fn parse_rejects_missing_credentials() {
        let err = Credentials::parse("token").unwrap_err();
        assert_eq!(err.status(), 401);
        assert_eq!(err.to_string(), "Authorization header is malformed");
        assert!(Credentials::parse("").is_err());
    }

    #[test]
    fn dao_options_default_to_no_transaction() {
        assert!(!DaoOptions::default().start_transaction);
        assert!(DaoOptions::transactional().start_transaction);
    }

    #[test]
    fn auth_info_deserializes_without_claims() {
        let info: AuthInfo = serde_json::from_str(r#"{"owner":"u1"}"#).unwrap();
        assert_eq!(info, AuthInfo::new("u1"));
    }
}
