//! Identity tokens for push deliveries.
//!
//! The dispatcher signs a short-lived HS256 JWT per request; the push ingress
//! verifies issuer, audience, expiry and that the subject is on the allowlist.

use crate::config::AuthConfig;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity secret is empty (set {env})")]
    MissingSecret { env: String },

    #[error("missing bearer token")]
    MissingToken,

    #[error("authorization header is not a bearer token")]
    MalformedHeader,

    #[error("invalid identity token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("subject '{0}' is not allowed to push")]
    SubjectNotAllowed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// A signed token and its expiry.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct IdentityTokens {
    config: AuthConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for IdentityTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityTokens")
            .field("issuer", &self.config.issuer)
            .field("audience", &self.config.audience)
            .field("enforce", &self.config.enforce)
            .finish_non_exhaustive()
    }
}

impl IdentityTokens {
    pub fn new(config: AuthConfig, secret: &str) -> Result<Self, AuthError> {
        if secret.trim().is_empty() {
            return Err(AuthError::MissingSecret {
                env: config.secret_env.clone(),
            });
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            config,
        })
    }

    /// Whether unauthenticated pushes must be rejected.
    pub fn enforce(&self) -> bool {
        self.config.enforce
    }

    pub fn mint(&self, now: DateTime<Utc>) -> Result<MintedToken, AuthError> {
        let ttl = i64::try_from(self.config.token_ttl_secs).unwrap_or(i64::MAX);
        let expires_at = now + Duration::seconds(ttl);
        let claims = IdentityClaims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            sub: self.config.subject.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(MintedToken { token, expires_at })
    }

    pub fn verify(&self, token: &str) -> Result<IdentityClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = jsonwebtoken::decode::<IdentityClaims>(token, &self.decoding, &validation)?;
        let claims = data.claims;
        if !self.config.allowed_subjects.is_empty()
            && !self.config.allowed_subjects.contains(&claims.sub)
        {
            return Err(AuthError::SubjectNotAllowed(claims.sub));
        }
        Ok(claims)
    }

    /// Verify the value of an `Authorization` header.
    pub fn verify_header(&self, header: Option<&str>) -> Result<IdentityClaims, AuthError> {
        let header = header.ok_or(AuthError::MissingToken)?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MalformedHeader)?;
        self.verify(token)
    }
}
