//! JSON Web Token authenticator.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use switchyard_core::{AuthInfo, Authenticator, Credentials, DispatchError};
use tracing::debug;

/// Validates `Bearer <jwt>` or `token <jwt>` credentials signed with HS256.
///
/// The `sub` claim becomes the owner; every other claim is kept in
/// [`AuthInfo::claims`]. When an endpoint passes `{"scope": "<name>"}` as
/// its auth options, the token's space-separated `scope` claim must
/// contain that name.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Require the `aud` claim to match.
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    /// Require the `iss` claim to match.
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(
        &self,
        credentials: &Credentials,
        options: Option<&Value>,
    ) -> anyhow::Result<AuthInfo> {
        if !(credentials.has_scheme("bearer") || credentials.has_scheme("token")) {
            return Err(DispatchError::Unauthorized(format!(
                "Unsupported authorization scheme {}",
                credentials.scheme
            ))
            .into());
        }

        let data = decode::<Map<String, Value>>(&credentials.credentials, &self.key, &self.validation)
            .map_err(|err| {
                debug!("token rejected: {err}");
                DispatchError::Unauthorized("Invalid token".to_string())
            })?;
        let mut claims = data.claims;

        let owner = match claims.remove("sub") {
            Some(Value::String(sub)) if !sub.is_empty() => sub,
            _ => {
                return Err(
                    DispatchError::Unauthorized("Token has no subject".to_string()).into(),
                )
            }
        };

        if let Some(required) = options.and_then(|o| o.get("scope")).and_then(Value::as_str) {
            let granted = claims
                .get("scope")
                .and_then(Value::as_str)
                .is_some_and(|scopes| scopes.split_whitespace().any(|s| s == required));
            if !granted {
                return Err(DispatchError::Forbidden(format!("Missing scope {required}")).into());
            }
        }

        Ok(AuthInfo { owner, claims })
    }
}
