//! JWT Authentication
//!
//! Validates JWTs from external auth providers (Supabase, Auth0, Firebase, etc.).
//! The server does NOT issue tokens - only validates them and extracts the
//! identity claims the presence layer needs.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use jsonwebtoken::{decode, DecodingKey, Validation, Algorithm, TokenData};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::presence::player::Identity;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format (preferred for external providers).
    pub public_key_pem: Option<String>,
    /// HS256 secret (Supabase projects sign with a shared secret).
    pub secret: Option<String>,
}

impl AuthConfig {
    /// Create config from environment variables.
    ///
    /// `AUTH_SECRET` wins over `SUPABASE_JWT_SECRET` when both are set.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET")
                .or_else(|_| std::env::var("SUPABASE_JWT_SECRET"))
                .ok(),
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Profile claims Supabase nests under `user_metadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMetadata {
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Whether the provider verified the email.
    #[serde(default)]
    pub email_verified: Option<bool>,
}

/// Claims we read from the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject - the user ID at the auth provider.
    #[serde(default)]
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer (auth provider).
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Top-level email, used when metadata lacks one.
    #[serde(default)]
    pub email: Option<String>,
    /// Profile metadata.
    #[serde(default)]
    pub user_metadata: Option<UserMetadata>,
}

impl TokenClaims {
    /// Extract the identity, requiring a verified email and a display name.
    pub fn identity(&self) -> Result<Identity, AuthError> {
        let metadata = self.user_metadata.as_ref()
            .ok_or_else(|| AuthError::MissingClaim("user_metadata".into()))?;

        let email = metadata.email.as_deref()
            .or(self.email.as_deref())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AuthError::MissingClaim("email".into()))?;

        let name = metadata.display_name.as_deref()
            .ok_or_else(|| AuthError::MissingClaim("display_name".into()))?;

        match metadata.email_verified {
            Some(true) => Ok(Identity::new(name, email)),
            Some(false) => Err(AuthError::EmailNotVerified),
            None => Err(AuthError::MissingClaim("email_verified".into())),
        }
    }
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Provider has not verified the email address.
    #[error("email not verified")]
    EmailNotVerified,
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Turns a bearer credential into a verified identity.
pub trait IdentityVerifier: Send + Sync {
    /// Verify `token` and return the identity it vouches for.
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// [`IdentityVerifier`] backed by JWT signature validation.
#[derive(Debug, Clone)]
pub struct JwtVerifier {
    config: AuthConfig,
}

impl JwtVerifier {
    /// Create a verifier.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        validate_token(token, &self.config)?.identity()
    }
}

/// Strip an optional `Bearer ` prefix from an Authorization header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
    if token.is_empty() { None } else { Some(token) }
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    if !config.is_configured() {
        return Err(AuthError::NotConfigured);
    }

    // Determine algorithm based on config
    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    };

    let mut validation = Validation::new(algorithm);

    // Only `exp` is mandatory; issuer/audience are checked when configured.
    validation.required_spec_claims = HashSet::from(["exp".to_string()]);

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }

    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }

    let token_data: TokenData<TokenClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(AuthError::NotConfigured);
    };

    let claims = token_data.claims;

    // jsonwebtoken allows 60s of leeway; the session should not outlive the token.
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if now > claims.exp {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn create_test_token(claims: &TokenClaims, secret: &str) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn test_claims() -> TokenClaims {
        TokenClaims {
            sub: "user123".into(),
            exp: now() + 3600,
            iat: now(),
            iss: Some("test-issuer".into()),
            aud: Some(serde_json::json!("authenticated")),
            email: None,
            user_metadata: Some(UserMetadata {
                email: Some("ada@example.com".into()),
                display_name: Some("Ada".into()),
                email_verified: Some(true),
            }),
        }
    }

    fn config() -> AuthConfig {
        AuthConfig { secret: Some(SECRET.into()), ..Default::default() }
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let token = create_test_token(&test_claims(), SECRET);
        let identity = JwtVerifier::new(config()).verify(&token).unwrap();
        assert_eq!(identity, Identity::new("Ada", "ada@example.com"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut claims = test_claims();
        claims.exp = 1; // Expired in 1970

        let token = create_test_token(&claims, SECRET);
        let result = validate_token(&token, &config());
        assert_eq!(result.unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = create_test_token(&test_claims(), "correct-secret-key-here!!!!!");
        let config = AuthConfig {
            secret: Some("wrong-secret-key-here!!!!!!".into()),
            ..Default::default()
        };

        let result = validate_token(&token, &config);
        assert_eq!(result.unwrap_err(), AuthError::InvalidSignature);
    }

    #[test]
    fn test_garbage_token_rejected() {
        let result = validate_token("not-a-jwt", &config());
        assert_eq!(result.unwrap_err(), AuthError::InvalidFormat);
    }

    #[test]
    fn test_issuer_validation() {
        let token = create_test_token(&test_claims(), SECRET);
        let config = AuthConfig {
            issuer: Some("wrong-issuer".into()),
            ..config()
        };

        let result = validate_token(&token, &config);
        assert_eq!(result.unwrap_err(), AuthError::InvalidIssuer);
    }

    #[test]
    fn test_unverified_email_rejected() {
        let mut claims = test_claims();
        if let Some(meta) = claims.user_metadata.as_mut() {
            meta.email_verified = Some(false);
        }
        let token = create_test_token(&claims, SECRET);

        let result = JwtVerifier::new(config()).verify(&token);
        assert_eq!(result.unwrap_err(), AuthError::EmailNotVerified);
    }

    #[test]
    fn test_missing_metadata_rejected() {
        let mut claims = test_claims();
        claims.user_metadata = None;
        let token = create_test_token(&claims, SECRET);

        let result = JwtVerifier::new(config()).verify(&token);
        assert!(matches!(result, Err(AuthError::MissingClaim(c)) if c == "user_metadata"));
    }

    #[test]
    fn test_top_level_email_fallback() {
        let mut claims = test_claims();
        claims.email = Some("top@example.com".into());
        if let Some(meta) = claims.user_metadata.as_mut() {
            meta.email = None;
        }

        let identity = claims.identity().unwrap();
        assert_eq!(identity.email, "top@example.com");
    }

    #[test]
    fn test_missing_display_name_rejected() {
        let mut claims = test_claims();
        if let Some(meta) = claims.user_metadata.as_mut() {
            meta.display_name = None;
        }
        assert!(matches!(claims.identity(), Err(AuthError::MissingClaim(c)) if c == "display_name"));
    }

    #[test]
    fn test_not_configured_error() {
        let result = validate_token("some.jwt.token", &AuthConfig::default());
        assert_eq!(result.unwrap_err(), AuthError::NotConfigured);
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("Bearer "), None);
    }
}
